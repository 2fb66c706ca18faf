use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::extract::CookieJar;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::{SESSION_COOKIE, hash_access_token};
use crate::error::ApiError;
use crate::models::AppState;

#[derive(Debug, Clone)]
pub struct AuthContext {
    /// `None` when authentication is disabled by configuration.
    pub session_id: Option<Uuid>,
}

/// Token from `Authorization: Bearer ...`, falling back to the session cookie.
pub async fn extract_token(parts: &mut Parts, state: &AppState) -> Option<String> {
    if let Ok(TypedHeader(authz)) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await
    {
        return Some(authz.token().to_string());
    }

    let jar = CookieJar::from_headers(&parts.headers);
    jar.get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            if state.auth.disabled {
                return Ok(AuthContext { session_id: None });
            }

            let token = extract_token(parts, state)
                .await
                .ok_or_else(ApiError::session_expired)?;
            let token_hash = hash_access_token(&token);

            let session_id: Uuid = sqlx::query_scalar(
                r#"
                SELECT session_id
                FROM admin_session
                WHERE session_token_hash = $1
                  AND revoked_at IS NULL
                  AND expires_at > now()
                "#,
            )
            .bind(&token_hash)
            .fetch_optional(&state.db)
            .await
            .map_err(ApiError::db)?
            .ok_or_else(ApiError::session_expired)?;

            // Touch last_seen_at (best-effort)
            let _ = sqlx::query(
                r#"
                UPDATE admin_session
                SET last_seen_at = now()
                WHERE session_id = $1
                "#,
            )
            .bind(session_id)
            .execute(&state.db)
            .await;

            Ok(AuthContext {
                session_id: Some(session_id),
            })
        }
    }
}
