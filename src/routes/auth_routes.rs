use axum::{
    Json, Router,
    extract::State,
    http::request::Parts,
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{SESSION_COOKIE, generate_access_token, hash_access_token, verify_password},
    error::ApiError,
    middleware::auth_context::{AuthContext, extract_token},
    models::{ApiOk, AppState, OkResponse},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/status", get(status))
        .route("/logout", post(logout))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
    pub device_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub authenticated: bool,
    pub auth_disabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

// Browser-session cookie; expiry is enforced server-side by admin_session.expires_at.
fn session_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(secure)
        .build()
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<ApiOk<LoginData>>), ApiError> {
    if req.password.is_empty() {
        return Err(ApiError::validation("password is required"));
    }

    let Some(stored_hash) = state.auth.password_hash.as_deref() else {
        // Only reachable with AUTH_DISABLED and no hash configured.
        return Err(ApiError::invalid_credentials());
    };
    if !verify_password(&req.password, stored_hash) {
        tracing::warn!("rejected staff login");
        return Err(ApiError::invalid_credentials());
    }

    let access_token = generate_access_token();
    let token_hash = hash_access_token(&access_token);
    let expires_at = Utc::now() + Duration::hours(state.auth.session_ttl_hours);

    let expires_at: DateTime<Utc> = sqlx::query_scalar(
        r#"
        INSERT INTO admin_session (session_token_hash, device_name, expires_at)
        VALUES ($1, $2, $3)
        RETURNING expires_at
        "#,
    )
    .bind(&token_hash)
    .bind(req.device_name.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(expires_at)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(%expires_at, "staff session created");

    let jar = jar.add(session_cookie(access_token.clone(), state.auth.cookie_secure));

    Ok((
        jar,
        Json(ApiOk {
            data: LoginData {
                access_token,
                expires_at,
            },
        }),
    ))
}

/// Never rejects: anonymous callers get `authenticated: false`.
pub async fn status(
    State(state): State<AppState>,
    mut parts: Parts,
) -> Result<Json<ApiOk<StatusData>>, ApiError> {
    if state.auth.disabled {
        return Ok(Json(ApiOk {
            data: StatusData {
                authenticated: true,
                auth_disabled: true,
                expires_at: None,
            },
        }));
    }

    let expires_at: Option<DateTime<Utc>> = match extract_token(&mut parts, &state).await {
        Some(token) => sqlx::query_scalar(
            r#"
            SELECT expires_at
            FROM admin_session
            WHERE session_token_hash = $1
              AND revoked_at IS NULL
              AND expires_at > now()
            "#,
        )
        .bind(hash_access_token(&token))
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?,
        None => None,
    };

    Ok(Json(ApiOk {
        data: StatusData {
            authenticated: expires_at.is_some(),
            auth_disabled: false,
            expires_at,
        },
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
    jar: CookieJar,
) -> Result<(CookieJar, Json<OkResponse>), ApiError> {
    if let Some(session_id) = auth.session_id {
        sqlx::query(
            r#"
            UPDATE admin_session
            SET revoked_at = now()
            WHERE session_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;
    }

    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    Ok((jar, Json(OkResponse::ok())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_is_locked_down() {
        let c = session_cookie("tok".into(), true);
        assert_eq!(c.name(), SESSION_COOKIE);
        assert_eq!(c.value(), "tok");
        assert_eq!(c.http_only(), Some(true));
        assert_eq!(c.secure(), Some(true));
        assert_eq!(c.same_site(), Some(SameSite::Lax));
        assert_eq!(c.path(), Some("/"));
    }
}
