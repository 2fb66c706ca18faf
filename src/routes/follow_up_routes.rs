// src/routes/follow_up_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::ApiError,
    live::{LiveEvent, LiveEventKind},
    middleware::auth_context::AuthContext,
    models::{
        clean, deserialize_double_option, one_of, AppState, FollowUpRow, Paging, FOLLOW_UP_COLUMNS,
        FOLLOW_UP_STATUSES, FOLLOW_UP_TYPES,
    },
    routes::patient_routes::fetch_patient,
};

const SCHEDULED: &str = "scheduled";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/follow_ups", get(list_follow_ups).post(create_follow_up))
        .route(
            "/follow_ups/{follow_up_id}",
            get(get_follow_up).patch(update_follow_up),
        )
        .route("/follow_ups/{follow_up_id}/complete", post(complete_follow_up))
        .route("/follow_ups/{follow_up_id}/cancel", post(cancel_follow_up))
        .route("/follow_ups/{follow_up_id}/missed", post(mark_missed))
}

fn not_scheduled(status: &str) -> ApiError {
    ApiError::Conflict(
        "INVALID_STATE",
        format!("follow-up is {status}; only scheduled follow-ups can change"),
    )
}

/// Appends a dated outcome line to existing notes.
fn append_note(existing: Option<&str>, outcome: &str, at: DateTime<Utc>) -> String {
    let line = format!("[{}] {outcome}", at.format("%Y-%m-%d %H:%M"));
    match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(prev) => format!("{prev}\n{line}"),
        None => line,
    }
}

fn publish_change(state: &AppState, row: &FollowUpRow) {
    state.live.publish(
        LiveEvent::new(LiveEventKind::FollowUpChanged, row.follow_up_id)
            .for_patient(row.patient_id)
            .with_payload(json!({
                "status": row.status,
                "scheduled_for": row.scheduled_for,
            })),
    );
}

async fn fetch_follow_up(state: &AppState, follow_up_id: Uuid) -> Result<FollowUpRow, ApiError> {
    let sql = format!("SELECT {FOLLOW_UP_COLUMNS} FROM follow_up WHERE follow_up_id = $1");
    sqlx::query_as::<_, FollowUpRow>(&sql)
        .bind(follow_up_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("follow-up"))
}

#[derive(Debug, Deserialize)]
pub struct FollowUpQuery {
    pub status: Option<String>,
    pub patient_id: Option<Uuid>,
    pub due_before: Option<DateTime<Utc>>,
    pub overdue: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_follow_ups(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<FollowUpQuery>,
) -> Result<Json<Vec<FollowUpRow>>, ApiError> {
    let status = match q.status.as_deref() {
        Some(s) => Some(one_of("status", s, FOLLOW_UP_STATUSES)?),
        None => None,
    };
    let paging = Paging { limit: q.limit, offset: q.offset };

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("SELECT ");
    qb.push(FOLLOW_UP_COLUMNS);
    qb.push(" FROM follow_up WHERE 1=1 ");

    if let Some(s) = status {
        qb.push(" AND status = ");
        qb.push_bind(s);
    }
    if let Some(pid) = q.patient_id {
        qb.push(" AND patient_id = ");
        qb.push_bind(pid);
    }
    if let Some(before) = q.due_before {
        qb.push(" AND scheduled_for < ");
        qb.push_bind(before);
    }
    if q.overdue.unwrap_or(false) {
        qb.push(" AND status = 'scheduled' AND scheduled_for < now() ");
    }

    qb.push(" ORDER BY scheduled_for ASC ");
    qb.push(" LIMIT ");
    qb.push_bind(paging.limit());
    qb.push(" OFFSET ");
    qb.push_bind(paging.offset());

    let rows: Vec<FollowUpRow> = qb
        .build_query_as::<FollowUpRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateFollowUpRequest {
    pub patient_id: Uuid,
    pub assessment_id: Option<Uuid>,
    pub follow_up_type: String,
    pub scheduled_for: DateTime<Utc>,
    pub notes: Option<String>,
    pub assigned_to: Option<String>,
}

pub async fn create_follow_up(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreateFollowUpRequest>,
) -> Result<Json<FollowUpRow>, ApiError> {
    let follow_up_type = one_of("follow_up_type", &req.follow_up_type, FOLLOW_UP_TYPES)?;
    fetch_patient(&state, req.patient_id).await?;

    if let Some(assessment_id) = req.assessment_id {
        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT patient_id FROM assessment WHERE assessment_id = $1")
                .bind(assessment_id)
                .fetch_optional(&state.db)
                .await
                .map_err(ApiError::db)?;
        match owner {
            None => return Err(ApiError::not_found("assessment")),
            Some(pid) if pid != req.patient_id => {
                return Err(ApiError::validation(
                    "assessment does not belong to this patient",
                ));
            }
            Some(_) => {}
        }
    }

    let sql = format!(
        "INSERT INTO follow_up (patient_id, assessment_id, follow_up_type, scheduled_for, notes, assigned_to) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {FOLLOW_UP_COLUMNS}"
    );
    let row: FollowUpRow = sqlx::query_as::<_, FollowUpRow>(&sql)
        .bind(req.patient_id)
        .bind(req.assessment_id)
        .bind(follow_up_type)
        .bind(req.scheduled_for)
        .bind(clean(req.notes.as_deref()))
        .bind(clean(req.assigned_to.as_deref()))
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    tracing::info!(follow_up_id = %row.follow_up_id, patient_id = %row.patient_id, "follow-up scheduled");
    publish_change(&state, &row);
    Ok(Json(row))
}

pub async fn get_follow_up(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(follow_up_id): Path<Uuid>,
) -> Result<Json<FollowUpRow>, ApiError> {
    Ok(Json(fetch_follow_up(&state, follow_up_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateFollowUpRequest {
    pub follow_up_type: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub assigned_to: Option<Option<String>>,
}

pub async fn update_follow_up(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(follow_up_id): Path<Uuid>,
    Json(req): Json<UpdateFollowUpRequest>,
) -> Result<Json<FollowUpRow>, ApiError> {
    let existing = fetch_follow_up(&state, follow_up_id).await?;
    if existing.status != SCHEDULED {
        return Err(not_scheduled(&existing.status));
    }

    let follow_up_type = match req.follow_up_type.as_deref() {
        Some(t) => one_of("follow_up_type", t, FOLLOW_UP_TYPES)?.to_string(),
        None => existing.follow_up_type,
    };
    let scheduled_for = req.scheduled_for.unwrap_or(existing.scheduled_for);
    let notes = match req.notes {
        None => existing.notes,
        Some(v) => clean(v.as_deref()),
    };
    let assigned_to = match req.assigned_to {
        None => existing.assigned_to,
        Some(v) => clean(v.as_deref()),
    };

    // The status guard is repeated in SQL so a concurrent transition wins cleanly.
    let sql = format!(
        "UPDATE follow_up \
         SET follow_up_type = $1, scheduled_for = $2, notes = $3, assigned_to = $4, updated_at = now() \
         WHERE follow_up_id = $5 AND status = 'scheduled' \
         RETURNING {FOLLOW_UP_COLUMNS}"
    );
    let row: FollowUpRow = sqlx::query_as::<_, FollowUpRow>(&sql)
        .bind(follow_up_type)
        .bind(scheduled_for)
        .bind(notes)
        .bind(assigned_to)
        .bind(follow_up_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| not_scheduled("no longer scheduled"))?;

    publish_change(&state, &row);
    Ok(Json(row))
}

#[derive(Debug, Default, Deserialize)]
pub struct OutcomeRequest {
    pub note: Option<String>,
}

/// Moves a scheduled follow-up to `target`, optionally appending an outcome note.
async fn transition(
    state: &AppState,
    follow_up_id: Uuid,
    target: &'static str,
    note: Option<String>,
) -> Result<FollowUpRow, ApiError> {
    let existing = fetch_follow_up(state, follow_up_id).await?;
    if existing.status != SCHEDULED {
        return Err(not_scheduled(&existing.status));
    }

    let now = Utc::now();
    let notes = match clean(note.as_deref()) {
        Some(outcome) => Some(append_note(existing.notes.as_deref(), &outcome, now)),
        None => existing.notes,
    };
    let completed_at = (target == "completed").then_some(now);

    let sql = format!(
        "UPDATE follow_up \
         SET status = $1, notes = $2, completed_at = COALESCE($3, completed_at), updated_at = now() \
         WHERE follow_up_id = $4 AND status = 'scheduled' \
         RETURNING {FOLLOW_UP_COLUMNS}"
    );
    let row: FollowUpRow = sqlx::query_as::<_, FollowUpRow>(&sql)
        .bind(target)
        .bind(notes)
        .bind(completed_at)
        .bind(follow_up_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| not_scheduled("no longer scheduled"))?;

    tracing::info!(%follow_up_id, status = target, "follow-up closed");
    publish_change(state, &row);
    Ok(row)
}

pub async fn complete_follow_up(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(follow_up_id): Path<Uuid>,
    body: Option<Json<OutcomeRequest>>,
) -> Result<Json<FollowUpRow>, ApiError> {
    let note = body.and_then(|Json(b)| b.note);
    Ok(Json(transition(&state, follow_up_id, "completed", note).await?))
}

pub async fn cancel_follow_up(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(follow_up_id): Path<Uuid>,
    body: Option<Json<OutcomeRequest>>,
) -> Result<Json<FollowUpRow>, ApiError> {
    let note = body.and_then(|Json(b)| b.note);
    Ok(Json(transition(&state, follow_up_id, "cancelled", note).await?))
}

pub async fn mark_missed(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(follow_up_id): Path<Uuid>,
    body: Option<Json<OutcomeRequest>>,
) -> Result<Json<FollowUpRow>, ApiError> {
    let note = body.and_then(|Json(b)| b.note);
    Ok(Json(transition(&state, follow_up_id, "missed", note).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn outcome_notes_are_appended_with_a_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 14, 30, 0).unwrap();
        assert_eq!(append_note(None, "Reached patient", at), "[2024-05-02 14:30] Reached patient");
        assert_eq!(
            append_note(Some("Call after lunch"), "No answer", at),
            "Call after lunch\n[2024-05-02 14:30] No answer"
        );
        assert_eq!(append_note(Some("  "), "Done", at), "[2024-05-02 14:30] Done");
    }

    #[test]
    fn closed_follow_ups_report_conflict() {
        let err = not_scheduled("completed");
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn patch_body_distinguishes_clearing_from_omitting() {
        let req: UpdateFollowUpRequest =
            serde_json::from_str(r#"{"assigned_to":null,"follow_up_type":"call"}"#).unwrap();
        assert_eq!(req.assigned_to, Some(None));
        assert_eq!(req.notes, None);
        assert!(req.scheduled_for.is_none());
    }
}
