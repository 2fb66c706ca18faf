// src/routes/clinic_routes.rs

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    ingest::clinic_name::slugify,
    middleware::auth_context::AuthContext,
    models::{clean, deserialize_double_option, AppState},
};

const CLINIC_NAME_MAX: usize = 128;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clinics", get(list_clinics).post(create_clinic))
        .route("/clinics/{clinic_id}", get(get_clinic).patch(update_clinic))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ClinicRow {
    pub clinic_id: Uuid,
    pub name: String,
    pub slug: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_name(raw: &str) -> Result<String, ApiError> {
    // Staff-entered names keep their casing; only chatbot-created clinics are title-cased.
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if name.chars().count() > CLINIC_NAME_MAX {
        return Err(ApiError::validation(format!(
            "name is too long (max {CLINIC_NAME_MAX})"
        )));
    }
    Ok(name)
}

fn conflict_on_slug(e: sqlx::Error) -> ApiError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ApiError::Conflict("CONFLICT", "a clinic with this name already exists".into())
        }
        _ => ApiError::db(e),
    }
}

pub async fn list_clinics(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<ClinicRow>>, ApiError> {
    let rows: Vec<ClinicRow> = sqlx::query_as::<_, ClinicRow>(
        r#"
        SELECT clinic_id, name, slug, address, phone, is_active, created_at, updated_at
        FROM clinic
        ORDER BY is_active DESC, name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateClinicRequest {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

pub async fn create_clinic(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreateClinicRequest>,
) -> Result<Json<ClinicRow>, ApiError> {
    let name = validate_name(&req.name)?;
    let slug = slugify(&name);

    let row: ClinicRow = sqlx::query_as::<_, ClinicRow>(
        r#"
        INSERT INTO clinic (name, slug, address, phone)
        VALUES ($1, $2, $3, $4)
        RETURNING clinic_id, name, slug, address, phone, is_active, created_at, updated_at
        "#,
    )
    .bind(&name)
    .bind(&slug)
    .bind(clean(req.address.as_deref()))
    .bind(clean(req.phone.as_deref()))
    .fetch_one(&state.db)
    .await
    .map_err(conflict_on_slug)?;

    Ok(Json(row))
}

async fn fetch_clinic(state: &AppState, clinic_id: Uuid) -> Result<ClinicRow, ApiError> {
    sqlx::query_as::<_, ClinicRow>(
        r#"
        SELECT clinic_id, name, slug, address, phone, is_active, created_at, updated_at
        FROM clinic
        WHERE clinic_id = $1
        "#,
    )
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))
}

pub async fn get_clinic(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ClinicRow>, ApiError> {
    Ok(Json(fetch_clinic(&state, clinic_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClinicRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub address: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    pub is_active: Option<bool>,
}

pub async fn update_clinic(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
    Json(req): Json<UpdateClinicRequest>,
) -> Result<Json<ClinicRow>, ApiError> {
    let existing = fetch_clinic(&state, clinic_id).await?;

    let (name, slug) = match req.name.as_deref() {
        Some(raw) => {
            let name = validate_name(raw)?;
            let slug = slugify(&name);
            (name, slug)
        }
        None => (existing.name, existing.slug),
    };

    let address = match req.address {
        None => existing.address,
        Some(v) => clean(v.as_deref()),
    };
    let phone = match req.phone {
        None => existing.phone,
        Some(v) => clean(v.as_deref()),
    };
    let is_active = req.is_active.unwrap_or(existing.is_active);

    let row: ClinicRow = sqlx::query_as::<_, ClinicRow>(
        r#"
        UPDATE clinic
        SET name = $1, slug = $2, address = $3, phone = $4, is_active = $5, updated_at = now()
        WHERE clinic_id = $6
        RETURNING clinic_id, name, slug, address, phone, is_active, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(slug)
    .bind(address)
    .bind(phone)
    .bind(is_active)
    .bind(clinic_id)
    .fetch_one(&state.db)
    .await
    .map_err(conflict_on_slug)?;

    Ok(Json(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_tidied_and_bounded() {
        assert_eq!(validate_name("  NHS   Riverside ").unwrap(), "NHS Riverside");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"a".repeat(CLINIC_NAME_MAX + 1)).is_err());
    }
}
