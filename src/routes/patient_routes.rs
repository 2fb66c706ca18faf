// src/routes/patient_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::ApiError,
    ingest::extract::{normalize_email, normalize_gender, normalize_phone},
    middleware::auth_context::AuthContext,
    models::{
        clean, deserialize_double_option, like_pattern, one_of, ApiOk, AppState, AssessmentRow,
        CommunicationRow, FollowUpRow, Paging, PatientRow, ASSESSMENT_COLUMNS,
        COMMUNICATION_COLUMNS, FOLLOW_UP_COLUMNS, GENDERS, PATIENT_COLUMNS, PATIENT_STATUSES,
    },
};

const PATIENT_STATUS_ACTIVE: &str = "active";
const PATIENT_STATUS_ARCHIVED: &str = "archived";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", post(create_patient).get(search_patients))
        .route("/patients/{patient_id}", get(get_patient).patch(update_patient))
        .route("/patients/{patient_id}/summary", get(get_patient_summary))
        .route("/patients/{patient_id}/archive", post(archive_patient))
        .route("/patients/{patient_id}/restore", post(restore_patient))
}

pub async fn fetch_patient(state: &AppState, patient_id: Uuid) -> Result<PatientRow, ApiError> {
    let sql = format!("SELECT {PATIENT_COLUMNS} FROM patient WHERE patient_id = $1");
    sqlx::query_as::<_, PatientRow>(&sql)
        .bind(patient_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("patient"))
}

fn validate_phone(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(p) => normalize_phone(p)
            .map(Some)
            .ok_or_else(|| ApiError::validation("phone must contain 7 to 15 digits")),
    }
}

fn validate_email(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(e) => normalize_email(e)
            .map(Some)
            .ok_or_else(|| ApiError::validation("email is not a valid address")),
    }
}

fn validate_age(age: Option<i32>) -> Result<Option<i32>, ApiError> {
    match age {
        Some(a) if !(0..=130).contains(&a) => Err(ApiError::validation("age must be 0..130")),
        other => Ok(other),
    }
}

/// Accepts the same spellings the chatbot uses (`F`, `man`, ...).
fn validate_gender(raw: &str) -> Result<&'static str, ApiError> {
    match normalize_gender(raw) {
        "unknown" => one_of("gender", raw, GENDERS),
        g => Ok(g),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub full_name: String,
    pub clinic_id: Option<Uuid>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub age: Option<i32>,
    pub gender: Option<String>,
}

pub async fn create_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Json<PatientRow>, ApiError> {
    let full_name = clean(Some(&req.full_name))
        .ok_or_else(|| ApiError::validation("full_name is required"))?;
    let phone = validate_phone(req.phone.as_deref())?;
    let email = validate_email(req.email.as_deref())?;
    let age = validate_age(req.age)?;
    let gender = match req.gender.as_deref() {
        Some(g) => validate_gender(g)?,
        None => "unknown",
    };

    let sql = format!(
        "INSERT INTO patient (clinic_id, full_name, phone, email, age, gender, source) \
         VALUES ($1, $2, $3, $4, $5, $6, 'staff') RETURNING {PATIENT_COLUMNS}"
    );
    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&sql)
        .bind(req.clinic_id)
        .bind(full_name)
        .bind(phone)
        .bind(email)
        .bind(age)
        .bind(gender)
        .fetch_one(&state.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                ApiError::not_found("clinic")
            }
            _ => ApiError::db(e),
        })?;

    tracing::info!(patient_id = %row.patient_id, "patient created");
    Ok(Json(row))
}

pub async fn get_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<PatientRow>, ApiError> {
    Ok(Json(fetch_patient(&state, patient_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn search_patients(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<PatientRow>>, ApiError> {
    let paging = Paging { limit: q.limit, offset: q.offset };
    let status = match q.status.as_deref() {
        Some(s) => Some(one_of("status", s, PATIENT_STATUSES)?),
        None => None,
    };

    let mut qb: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new(format!("SELECT {PATIENT_COLUMNS} FROM patient WHERE 1=1 "));

    if let Some(keyword) = q.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let like = like_pattern(keyword);
        qb.push(" AND (full_name ILIKE ");
        qb.push_bind(like.clone());
        qb.push(r" ESCAPE '\' OR phone ILIKE ");
        qb.push_bind(like.clone());
        qb.push(r" ESCAPE '\' OR email ILIKE ");
        qb.push_bind(like);
        qb.push(r" ESCAPE '\') ");
    }
    if let Some(clinic_id) = q.clinic_id {
        qb.push(" AND clinic_id = ");
        qb.push_bind(clinic_id);
    }
    if let Some(status) = status {
        qb.push(" AND status = ");
        qb.push_bind(status);
    }

    qb.push(" ORDER BY COALESCE(last_contact_at, created_at) DESC ");
    qb.push(" LIMIT ");
    qb.push_bind(paging.limit());
    qb.push(" OFFSET ");
    qb.push_bind(paging.offset());

    let rows: Vec<PatientRow> = qb
        .build_query_as::<PatientRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub clinic_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub age: Option<Option<i32>>,
    pub gender: Option<String>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<PatientRow>, ApiError> {
    let existing = fetch_patient(&state, patient_id).await?;

    let full_name = match req.full_name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        Some(_) => return Err(ApiError::validation("full_name cannot be empty")),
        None => existing.full_name,
    };
    let clinic_id = match req.clinic_id {
        None => existing.clinic_id,
        Some(v) => v,
    };
    let phone = match req.phone {
        None => existing.phone,
        Some(v) => validate_phone(v.as_deref())?,
    };
    let email = match req.email {
        None => existing.email,
        Some(v) => validate_email(v.as_deref())?,
    };
    let age = match req.age {
        None => existing.age,
        Some(v) => validate_age(v)?,
    };
    let gender = match req.gender.as_deref() {
        Some(g) => validate_gender(g)?.to_string(),
        None => existing.gender,
    };

    let sql = format!(
        "UPDATE patient \
         SET full_name = $1, clinic_id = $2, phone = $3, email = $4, age = $5, gender = $6, \
             updated_at = now() \
         WHERE patient_id = $7 \
         RETURNING {PATIENT_COLUMNS}"
    );
    let updated: PatientRow = sqlx::query_as::<_, PatientRow>(&sql)
        .bind(full_name)
        .bind(clinic_id)
        .bind(phone)
        .bind(email)
        .bind(age)
        .bind(gender)
        .bind(patient_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(updated))
}

async fn set_status(state: &AppState, patient_id: Uuid, status: &str) -> Result<PatientRow, ApiError> {
    let sql = format!(
        "UPDATE patient SET status = $1, updated_at = now() WHERE patient_id = $2 \
         RETURNING {PATIENT_COLUMNS}"
    );
    sqlx::query_as::<_, PatientRow>(&sql)
        .bind(status)
        .bind(patient_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("patient"))
}

pub async fn archive_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<PatientRow>, ApiError> {
    Ok(Json(set_status(&state, patient_id, PATIENT_STATUS_ARCHIVED).await?))
}

pub async fn restore_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<PatientRow>, ApiError> {
    Ok(Json(set_status(&state, patient_id, PATIENT_STATUS_ACTIVE).await?))
}

#[derive(Debug, Serialize)]
pub struct PatientSummaryData {
    pub patient: PatientRow,
    pub assessments: Vec<AssessmentRow>,
    pub communications: Vec<CommunicationRow>,
    pub follow_ups: Vec<FollowUpRow>,
}

pub async fn get_patient_summary(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientSummaryData>>, ApiError> {
    let patient = fetch_patient(&state, patient_id).await?;

    let sql = format!(
        "SELECT {ASSESSMENT_COLUMNS} FROM assessment WHERE patient_id = $1 ORDER BY created_at DESC"
    );
    let assessments: Vec<AssessmentRow> = sqlx::query_as::<_, AssessmentRow>(&sql)
        .bind(patient_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    let sql = format!(
        "SELECT {COMMUNICATION_COLUMNS} FROM communication WHERE patient_id = $1 \
         ORDER BY occurred_at DESC LIMIT 30"
    );
    let communications: Vec<CommunicationRow> = sqlx::query_as::<_, CommunicationRow>(&sql)
        .bind(patient_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    let sql = format!(
        "SELECT {FOLLOW_UP_COLUMNS} FROM follow_up WHERE patient_id = $1 \
         ORDER BY (status = 'scheduled') DESC, scheduled_for ASC"
    );
    let follow_ups: Vec<FollowUpRow> = sqlx::query_as::<_, FollowUpRow>(&sql)
        .bind(patient_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: PatientSummaryData {
            patient,
            assessments,
            communications,
            follow_ups,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_and_email_validation() {
        assert_eq!(validate_phone(Some(" ")).unwrap(), None);
        assert_eq!(validate_phone(Some("+1 (555) 010-2000")).unwrap().as_deref(), Some("+15550102000"));
        assert!(validate_phone(Some("123")).is_err());

        assert_eq!(validate_email(None).unwrap(), None);
        assert_eq!(validate_email(Some("A@B.io")).unwrap().as_deref(), Some("a@b.io"));
        assert!(validate_email(Some("nope")).is_err());
    }

    #[test]
    fn gender_accepts_chatbot_spellings() {
        assert_eq!(validate_gender("F").unwrap(), "female");
        assert_eq!(validate_gender("Unknown").unwrap(), "unknown");
        assert!(validate_gender("robot").is_err());
    }

    #[test]
    fn age_validation() {
        assert_eq!(validate_age(None).unwrap(), None);
        assert_eq!(validate_age(Some(0)).unwrap(), Some(0));
        assert!(validate_age(Some(131)).is_err());
        assert!(validate_age(Some(-1)).is_err());
    }

    #[test]
    fn patch_body_distinguishes_clear_from_keep() {
        let req: UpdatePatientRequest =
            serde_json::from_str(r#"{"phone": null, "gender": "F"}"#).unwrap();
        assert_eq!(req.phone, Some(None));
        assert_eq!(req.email, None);
        assert_eq!(req.gender.as_deref(), Some("F"));
    }
}
