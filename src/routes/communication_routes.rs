// src/routes/communication_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{
        clean, like_pattern, one_of, AppState, CommunicationRow, OkResponse, Paging, CHANNELS,
        COMMUNICATION_COLUMNS, DIRECTIONS,
    },
    routes::patient_routes::fetch_patient,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/patients/{patient_id}/communications",
            get(list_for_patient).post(create_communication),
        )
        .route("/communications", get(search_communications))
        .route(
            "/communications/{communication_id}",
            get(get_communication).delete(delete_communication),
        )
}

pub async fn list_for_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<CommunicationRow>>, ApiError> {
    fetch_patient(&state, patient_id).await?;

    let sql = format!(
        "SELECT {COMMUNICATION_COLUMNS} FROM communication WHERE patient_id = $1 \
         ORDER BY occurred_at DESC LIMIT $2 OFFSET $3"
    );
    let rows: Vec<CommunicationRow> = sqlx::query_as::<_, CommunicationRow>(&sql)
        .bind(patient_id)
        .bind(paging.limit())
        .bind(paging.offset())
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateCommunicationRequest {
    pub channel: String,
    pub direction: String,
    pub subject: Option<String>,
    pub body: String,
    pub staff_name: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

pub async fn create_communication(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<CreateCommunicationRequest>,
) -> Result<Json<CommunicationRow>, ApiError> {
    let channel = one_of("channel", &req.channel, CHANNELS)?;
    let direction = one_of("direction", &req.direction, DIRECTIONS)?;
    let body = clean(Some(&req.body)).ok_or_else(|| ApiError::validation("body is required"))?;
    let occurred_at = req.occurred_at.unwrap_or_else(Utc::now);

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Moves last_contact_at forward only; back-dated entries leave it alone.
    let touched = sqlx::query(
        r#"
        UPDATE patient
        SET last_contact_at = GREATEST(COALESCE(last_contact_at, $2), $2),
            updated_at = now()
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .bind(occurred_at)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if touched.rows_affected() == 0 {
        return Err(ApiError::not_found("patient"));
    }

    let sql = format!(
        "INSERT INTO communication (patient_id, channel, direction, subject, body, staff_name, occurred_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {COMMUNICATION_COLUMNS}"
    );
    let row: CommunicationRow = sqlx::query_as::<_, CommunicationRow>(&sql)
        .bind(patient_id)
        .bind(channel)
        .bind(direction)
        .bind(clean(req.subject.as_deref()))
        .bind(&body)
        .bind(clean(req.staff_name.as_deref()))
        .bind(occurred_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct CommunicationSearchQuery {
    pub patient_id: Option<Uuid>,
    pub channel: Option<String>,
    pub direction: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn search_communications(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<CommunicationSearchQuery>,
) -> Result<Json<Vec<CommunicationRow>>, ApiError> {
    let channel = match q.channel.as_deref() {
        Some(c) => Some(one_of("channel", c, CHANNELS)?),
        None => None,
    };
    let direction = match q.direction.as_deref() {
        Some(d) => Some(one_of("direction", d, DIRECTIONS)?),
        None => None,
    };
    let paging = Paging { limit: q.limit, offset: q.offset };

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("SELECT ");
    qb.push(COMMUNICATION_COLUMNS);
    qb.push(" FROM communication WHERE 1=1 ");

    if let Some(pid) = q.patient_id {
        qb.push(" AND patient_id = ");
        qb.push_bind(pid);
    }
    if let Some(c) = channel {
        qb.push(" AND channel = ");
        qb.push_bind(c);
    }
    if let Some(d) = direction {
        qb.push(" AND direction = ");
        qb.push_bind(d);
    }
    if let Some(from) = q.from {
        qb.push(" AND occurred_at >= ");
        qb.push_bind(from);
    }
    if let Some(to) = q.to {
        qb.push(" AND occurred_at <= ");
        qb.push_bind(to);
    }
    if let Some(keyword) = clean(q.q.as_deref()) {
        let like = like_pattern(&keyword);
        qb.push(" AND (body ILIKE ");
        qb.push_bind(like.clone());
        qb.push(r" ESCAPE '\' OR subject ILIKE ");
        qb.push_bind(like);
        qb.push(r" ESCAPE '\') ");
    }

    qb.push(" ORDER BY occurred_at DESC ");
    qb.push(" LIMIT ");
    qb.push_bind(paging.limit());
    qb.push(" OFFSET ");
    qb.push_bind(paging.offset());

    let rows: Vec<CommunicationRow> = qb
        .build_query_as::<CommunicationRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(rows))
}

pub async fn get_communication(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(communication_id): Path<Uuid>,
) -> Result<Json<CommunicationRow>, ApiError> {
    let sql = format!("SELECT {COMMUNICATION_COLUMNS} FROM communication WHERE communication_id = $1");
    let row: CommunicationRow = sqlx::query_as::<_, CommunicationRow>(&sql)
        .bind(communication_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("communication"))?;

    Ok(Json(row))
}

pub async fn delete_communication(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(communication_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let res = sqlx::query("DELETE FROM communication WHERE communication_id = $1")
        .bind(communication_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("communication"));
    }
    Ok(Json(OkResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_minimal_body() {
        let req: CreateCommunicationRequest = serde_json::from_str(
            r#"{"channel":"WhatsApp","direction":"inbound","body":"Running late"}"#,
        )
        .unwrap();
        assert_eq!(one_of("channel", &req.channel, CHANNELS).unwrap(), "whatsapp");
        assert!(req.occurred_at.is_none());
        assert!(req.subject.is_none());
    }

    #[test]
    fn search_query_parses_timestamps() {
        let q: CommunicationSearchQuery = serde_json::from_str(
            r#"{"from":"2024-03-01T00:00:00Z","channel":"sms"}"#,
        )
        .unwrap();
        assert_eq!(q.from.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(q.to.is_none());
    }
}
