// src/routes/assessment_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{
        clean, deserialize_double_option, one_of, ApiOk, AppState, AssessmentRow, Paging,
        ResponseRow, ASSESSMENT_COLUMNS, ASSESSMENT_STATUSES, RESPONSE_COLUMNS, RISK_LEVELS,
    },
};

const STATUS_REVIEWED: &str = "reviewed";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/assessments", get(list_assessments))
        .route(
            "/assessments/{assessment_id}",
            get(get_assessment).patch(update_assessment),
        )
        .route("/responses/flagged", get(list_flagged_responses))
        .route("/responses/{response_id}/review", post(review_response))
}

/// Assessment row with the names the list view shows next to it.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AssessmentListItem {
    pub assessment_id: Uuid,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub clinic_id: Option<Uuid>,
    pub clinic_name: Option<String>,
    pub condition_id: Option<Uuid>,
    pub condition_name: Option<String>,
    pub risk_level: String,
    pub status: String,
    pub summary: Option<String>,
    pub flagged_count: i32,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AssessmentQuery {
    pub risk_level: Option<String>,
    pub status: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub flagged_only: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_assessments(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<AssessmentQuery>,
) -> Result<Json<Vec<AssessmentListItem>>, ApiError> {
    let risk_level = match q.risk_level.as_deref() {
        Some(r) => Some(one_of("risk_level", r, RISK_LEVELS)?),
        None => None,
    };
    let status = match q.status.as_deref() {
        Some(s) => Some(one_of("status", s, ASSESSMENT_STATUSES)?),
        None => None,
    };
    let paging = Paging { limit: q.limit, offset: q.offset };

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        r#"
        SELECT
          a.assessment_id,
          a.patient_id,
          p.full_name AS patient_name,
          a.clinic_id,
          c.name AS clinic_name,
          a.condition_id,
          cd.name AS condition_name,
          a.risk_level,
          a.status,
          a.summary,
          a.flagged_count,
          a.created_at,
          a.reviewed_at
        FROM assessment a
        JOIN patient p ON p.patient_id = a.patient_id
        LEFT JOIN clinic c ON c.clinic_id = a.clinic_id
        LEFT JOIN condition cd ON cd.condition_id = a.condition_id
        WHERE 1=1
        "#,
    );

    if let Some(r) = risk_level {
        qb.push(" AND a.risk_level = ");
        qb.push_bind(r);
    }
    if let Some(s) = status {
        qb.push(" AND a.status = ");
        qb.push_bind(s);
    }
    if let Some(cid) = q.clinic_id {
        qb.push(" AND a.clinic_id = ");
        qb.push_bind(cid);
    }
    if let Some(pid) = q.patient_id {
        qb.push(" AND a.patient_id = ");
        qb.push_bind(pid);
    }
    if q.flagged_only.unwrap_or(false) {
        qb.push(" AND a.flagged_count > 0 ");
    }
    if let Some(from) = q.from {
        qb.push(" AND a.created_at >= ");
        qb.push_bind(from);
    }
    if let Some(to) = q.to {
        qb.push(" AND a.created_at <= ");
        qb.push_bind(to);
    }

    qb.push(" ORDER BY a.created_at DESC ");
    qb.push(" LIMIT ");
    qb.push_bind(paging.limit());
    qb.push(" OFFSET ");
    qb.push_bind(paging.offset());

    let rows: Vec<AssessmentListItem> = qb
        .build_query_as::<AssessmentListItem>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(rows))
}

async fn fetch_assessment(state: &AppState, assessment_id: Uuid) -> Result<AssessmentRow, ApiError> {
    let sql = format!("SELECT {ASSESSMENT_COLUMNS} FROM assessment WHERE assessment_id = $1");
    sqlx::query_as::<_, AssessmentRow>(&sql)
        .bind(assessment_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("assessment"))
}

#[derive(Debug, Serialize)]
pub struct AssessmentDetail {
    pub assessment: AssessmentRow,
    pub responses: Vec<ResponseRow>,
}

pub async fn get_assessment(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(assessment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AssessmentDetail>>, ApiError> {
    let assessment = fetch_assessment(&state, assessment_id).await?;

    let sql = format!(
        "SELECT {RESPONSE_COLUMNS} FROM response WHERE assessment_id = $1 \
         ORDER BY position ASC, created_at ASC"
    );
    let responses: Vec<ResponseRow> = sqlx::query_as::<_, ResponseRow>(&sql)
        .bind(assessment_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: AssessmentDetail {
            assessment,
            responses,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAssessmentRequest {
    pub status: Option<String>,
    pub risk_level: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub summary: Option<Option<String>>,
}

pub async fn update_assessment(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(assessment_id): Path<Uuid>,
    Json(req): Json<UpdateAssessmentRequest>,
) -> Result<Json<AssessmentRow>, ApiError> {
    let existing = fetch_assessment(&state, assessment_id).await?;

    let status = match req.status.as_deref() {
        Some(s) => one_of("status", s, ASSESSMENT_STATUSES)?.to_string(),
        None => existing.status.clone(),
    };
    let risk_level = match req.risk_level.as_deref() {
        Some(r) => one_of("risk_level", r, RISK_LEVELS)?.to_string(),
        None => existing.risk_level,
    };
    let summary = match req.summary {
        None => existing.summary,
        Some(v) => clean(v.as_deref()),
    };
    let becomes_reviewed = status == STATUS_REVIEWED && existing.status != STATUS_REVIEWED;

    let sql = format!(
        "UPDATE assessment \
         SET status = $1, risk_level = $2, summary = $3, \
             reviewed_at = CASE WHEN $4 THEN now() ELSE reviewed_at END \
         WHERE assessment_id = $5 \
         RETURNING {ASSESSMENT_COLUMNS}"
    );
    let row: AssessmentRow = sqlx::query_as::<_, AssessmentRow>(&sql)
        .bind(&status)
        .bind(risk_level)
        .bind(summary)
        .bind(becomes_reviewed)
        .bind(assessment_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    tracing::info!(%assessment_id, status = %row.status, "assessment updated");
    Ok(Json(row))
}

/// Flagged answer with enough context for the review queue.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct FlaggedResponseItem {
    pub response_id: Uuid,
    pub assessment_id: Uuid,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub risk_level: String,
    pub question_text: String,
    pub answer_text: String,
    pub flag_reason: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct FlaggedQuery {
    pub reviewed: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_flagged_responses(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<FlaggedQuery>,
) -> Result<Json<Vec<FlaggedResponseItem>>, ApiError> {
    let paging = Paging { limit: q.limit, offset: q.offset };
    let reviewed = q.reviewed.unwrap_or(false);

    let rows: Vec<FlaggedResponseItem> = sqlx::query_as::<_, FlaggedResponseItem>(
        r#"
        SELECT
          r.response_id,
          r.assessment_id,
          a.patient_id,
          p.full_name AS patient_name,
          a.risk_level,
          r.question_text,
          r.answer_text,
          r.flag_reason,
          r.reviewed_at,
          r.review_note,
          r.created_at
        FROM response r
        JOIN assessment a ON a.assessment_id = r.assessment_id
        JOIN patient p ON p.patient_id = a.patient_id
        WHERE r.is_flagged = TRUE
          AND (r.reviewed_at IS NOT NULL) = $1
        ORDER BY r.created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(reviewed)
    .bind(paging.limit())
    .bind(paging.offset())
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct ReviewResponseRequest {
    pub note: Option<String>,
}

pub async fn review_response(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(response_id): Path<Uuid>,
    Json(req): Json<ReviewResponseRequest>,
) -> Result<Json<ResponseRow>, ApiError> {
    let sql = format!(
        "UPDATE response SET reviewed_at = now(), review_note = $1 \
         WHERE response_id = $2 RETURNING {RESPONSE_COLUMNS}"
    );
    let row: ResponseRow = sqlx::query_as::<_, ResponseRow>(&sql)
        .bind(clean(req.note.as_deref()))
        .bind(response_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("response"))?;

    Ok(Json(row))
}
