// src/routes/analytics_routes.rs
//
// Read-only dashboard aggregates. Every query runs straight against the live
// tables; nothing is cached.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
};

const DAYS_DEFAULT: i64 = 30;
const DAYS_MAX: i64 = 365;
const TOP_CONDITIONS_DEFAULT: i64 = 10;
const TOP_CONDITIONS_MAX: i64 = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analytics/overview", get(overview))
        .route("/analytics/assessments_by_day", get(assessments_by_day))
        .route("/analytics/risk_distribution", get(risk_distribution))
        .route("/analytics/by_clinic", get(by_clinic))
        .route("/analytics/top_conditions", get(top_conditions))
        .route("/analytics/follow_up_status", get(follow_up_status))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Overview {
    pub total_patients: i64,
    pub active_patients: i64,
    pub total_assessments: i64,
    pub assessments_today: i64,
    pub high_risk_open: i64,
    pub unreviewed_flags: i64,
    pub follow_ups_due_today: i64,
    pub follow_ups_overdue: i64,
    pub consultations_failed: i64,
}

pub async fn overview(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Overview>>, ApiError> {
    // "Today" is the database server's calendar day.
    let row: Overview = sqlx::query_as::<_, Overview>(
        r#"
        SELECT
          (SELECT COUNT(*) FROM patient) AS total_patients,
          (SELECT COUNT(*) FROM patient WHERE status = 'active') AS active_patients,
          (SELECT COUNT(*) FROM assessment) AS total_assessments,
          (SELECT COUNT(*) FROM assessment WHERE created_at >= date_trunc('day', now()))
            AS assessments_today,
          (SELECT COUNT(*) FROM assessment
            WHERE risk_level = 'high' AND status IN ('new', 'in_review')) AS high_risk_open,
          (SELECT COUNT(*) FROM response WHERE is_flagged AND reviewed_at IS NULL)
            AS unreviewed_flags,
          (SELECT COUNT(*) FROM follow_up
            WHERE status = 'scheduled'
              AND scheduled_for >= date_trunc('day', now())
              AND scheduled_for < date_trunc('day', now()) + interval '1 day')
            AS follow_ups_due_today,
          (SELECT COUNT(*) FROM follow_up
            WHERE status = 'scheduled' AND scheduled_for < now()) AS follow_ups_overdue,
          (SELECT COUNT(*) FROM consultation WHERE status = 'failed') AS consultations_failed
        "#,
    )
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}

fn window_days(raw: Option<i64>) -> Result<i64, ApiError> {
    match raw {
        None => Ok(DAYS_DEFAULT),
        Some(d) if (1..=DAYS_MAX).contains(&d) => Ok(d),
        Some(_) => Err(ApiError::validation(format!(
            "days must be between 1 and {DAYS_MAX}"
        ))),
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DayCount {
    pub day: NaiveDate,
    pub total: i64,
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

pub async fn assessments_by_day(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<DaysQuery>,
) -> Result<Json<ApiOk<Vec<DayCount>>>, ApiError> {
    let days = window_days(q.days)?;

    let rows: Vec<DayCount> = sqlx::query_as::<_, DayCount>(
        r#"
        SELECT
          d.day::date AS day,
          COUNT(a.assessment_id) AS total,
          COUNT(a.assessment_id) FILTER (WHERE a.risk_level = 'low') AS low,
          COUNT(a.assessment_id) FILTER (WHERE a.risk_level = 'medium') AS medium,
          COUNT(a.assessment_id) FILTER (WHERE a.risk_level = 'high') AS high
        FROM generate_series(
               date_trunc('day', now()) - make_interval(days => $1::int - 1),
               date_trunc('day', now()),
               interval '1 day'
             ) AS d(day)
        LEFT JOIN assessment a
          ON a.created_at >= d.day AND a.created_at < d.day + interval '1 day'
        GROUP BY d.day
        ORDER BY d.day ASC
        "#,
    )
    .bind(days as i32)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct LabelCount {
    pub label: String,
    pub count: i64,
}

pub async fn risk_distribution(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<LabelCount>>>, ApiError> {
    // Every level is reported, including those with no assessments.
    let rows: Vec<LabelCount> = sqlx::query_as::<_, LabelCount>(
        r#"
        SELECT l.label, COUNT(a.assessment_id) AS count
        FROM (VALUES ('low', 1), ('medium', 2), ('high', 3)) AS l(label, ord)
        LEFT JOIN assessment a ON a.risk_level = l.label
        GROUP BY l.label, l.ord
        ORDER BY l.ord
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ClinicCount {
    pub clinic_id: Option<Uuid>,
    pub clinic_name: Option<String>,
    pub patients: i64,
    pub assessments: i64,
    pub high_risk: i64,
}

pub async fn by_clinic(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ClinicCount>>>, ApiError> {
    // Assessments without a clinic are grouped under a null clinic.
    let rows: Vec<ClinicCount> = sqlx::query_as::<_, ClinicCount>(
        r#"
        SELECT
          a.clinic_id,
          c.name AS clinic_name,
          COUNT(DISTINCT a.patient_id) AS patients,
          COUNT(*) AS assessments,
          COUNT(*) FILTER (WHERE a.risk_level = 'high') AS high_risk
        FROM assessment a
        LEFT JOIN clinic c ON c.clinic_id = a.clinic_id
        GROUP BY a.clinic_id, c.name
        ORDER BY assessments DESC, clinic_name ASC NULLS LAST
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConditionCount {
    pub condition_id: Uuid,
    pub name: String,
    pub assessments: i64,
    pub high_risk: i64,
}

pub async fn top_conditions(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<TopQuery>,
) -> Result<Json<ApiOk<Vec<ConditionCount>>>, ApiError> {
    let limit = q.limit.unwrap_or(TOP_CONDITIONS_DEFAULT).clamp(1, TOP_CONDITIONS_MAX);

    let rows: Vec<ConditionCount> = sqlx::query_as::<_, ConditionCount>(
        r#"
        SELECT
          cd.condition_id,
          cd.name,
          COUNT(a.assessment_id) AS assessments,
          COUNT(a.assessment_id) FILTER (WHERE a.risk_level = 'high') AS high_risk
        FROM condition cd
        JOIN assessment a ON a.condition_id = cd.condition_id
        GROUP BY cd.condition_id, cd.name
        ORDER BY assessments DESC, cd.name ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn follow_up_status(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<LabelCount>>>, ApiError> {
    let rows: Vec<LabelCount> = sqlx::query_as::<_, LabelCount>(
        r#"
        SELECT s.label, COUNT(f.follow_up_id) AS count
        FROM (VALUES ('scheduled', 1), ('completed', 2), ('cancelled', 3), ('missed', 4))
             AS s(label, ord)
        LEFT JOIN follow_up f ON f.status = s.label
        GROUP BY s.label, s.ord
        ORDER BY s.ord
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}
