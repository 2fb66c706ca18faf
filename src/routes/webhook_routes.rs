// src/routes/webhook_routes.rs

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::secrets_match,
    error::ApiError,
    ingest::{self, IngestReceipt},
    middleware::auth_context::AuthContext,
    models::{one_of, ApiOk, AppState, Paging},
};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

const CHATBOT_SOURCE: &str = "chatbot";
const CONSULTATION_STATUSES: &[&str] = &["received", "processed", "duplicate", "failed"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/chatbot", post(chatbot_webhook))
        .route("/consultations", get(list_consultations))
        .route("/consultations/{consultation_id}", get(get_consultation))
        .route(
            "/consultations/{consultation_id}/reprocess",
            post(reprocess_consultation),
        )
}

fn check_secret(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if secrets_match(expected, provided) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized(
            "INVALID_WEBHOOK_SECRET",
            "webhook secret is missing or incorrect".into(),
        ))
    }
}

fn receipt_status(receipt: &IngestReceipt) -> StatusCode {
    match receipt.status {
        "processed" => StatusCode::CREATED,
        "duplicate" => StatusCode::OK,
        _ => StatusCode::ACCEPTED,
    }
}

/// Chatbot delivery endpoint. Staff sessions are not required; the shared
/// secret header stands in when one is configured.
pub async fn chatbot_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiOk<IngestReceipt>>), ApiError> {
    check_secret(state.webhook_secret.as_deref(), &headers)?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("body is not valid JSON: {e}")))?;

    let receipt = ingest::ingest(&state.db, &state.live, payload, CHATBOT_SOURCE).await?;
    Ok((receipt_status(&receipt), Json(ApiOk { data: receipt })))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConsultationRow {
    pub consultation_id: Uuid,
    pub source: String,
    pub external_session_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub assessment_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConsultationDetail {
    pub consultation_id: Uuid,
    pub source: String,
    pub external_session_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub assessment_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub raw_payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct ConsultationQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_consultations(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ConsultationQuery>,
) -> Result<Json<Vec<ConsultationRow>>, ApiError> {
    let status = match q.status.as_deref() {
        Some(s) => Some(one_of("status", s, CONSULTATION_STATUSES)?),
        None => None,
    };
    let paging = Paging { limit: q.limit, offset: q.offset };

    let rows: Vec<ConsultationRow> = sqlx::query_as::<_, ConsultationRow>(
        r#"
        SELECT consultation_id, source, external_session_id, status, error,
               assessment_id, received_at, processed_at
        FROM consultation
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY received_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(status)
    .bind(paging.limit())
    .bind(paging.offset())
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

async fn fetch_consultation(
    state: &AppState,
    consultation_id: Uuid,
) -> Result<ConsultationDetail, ApiError> {
    sqlx::query_as::<_, ConsultationDetail>(
        r#"
        SELECT consultation_id, source, external_session_id, status, error,
               assessment_id, received_at, processed_at, raw_payload
        FROM consultation
        WHERE consultation_id = $1
        "#,
    )
    .bind(consultation_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("consultation"))
}

pub async fn get_consultation(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ConsultationDetail>>, ApiError> {
    Ok(Json(ApiOk {
        data: fetch_consultation(&state, consultation_id).await?,
    }))
}

pub async fn reprocess_consultation(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(consultation_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiOk<IngestReceipt>>), ApiError> {
    let existing = fetch_consultation(&state, consultation_id).await?;

    // The status check itself happens under the row lock; a row that is already
    // processed or duplicate comes back as 409 ALREADY_PROCESSED.
    tracing::info!(%consultation_id, previous = %existing.status, "reprocessing consultation");
    let receipt =
        ingest::process(&state.db, &state.live, consultation_id, &existing.raw_payload).await?;
    Ok((receipt_status(&receipt), Json(ApiOk { data: receipt })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn receipt(status: &'static str) -> IngestReceipt {
        IngestReceipt {
            consultation_id: Uuid::new_v4(),
            status,
            patient_id: None,
            assessment_id: None,
            risk_level: None,
            flagged_count: 0,
            error: None,
        }
    }

    #[test]
    fn secret_is_optional_until_configured() {
        let empty = HeaderMap::new();
        assert!(check_secret(None, &empty).is_ok());

        let err = check_secret(Some("s3cret"), &empty).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(check_secret(Some("s3cret"), &headers).is_ok());

        headers.insert(WEBHOOK_SECRET_HEADER, HeaderValue::from_static("guess"));
        assert!(check_secret(Some("s3cret"), &headers).is_err());
    }

    #[test]
    fn receipt_outcome_maps_to_http_status() {
        assert_eq!(receipt_status(&receipt("processed")), StatusCode::CREATED);
        assert_eq!(receipt_status(&receipt("duplicate")), StatusCode::OK);
        assert_eq!(receipt_status(&receipt("failed")), StatusCode::ACCEPTED);
    }
}
