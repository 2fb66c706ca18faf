// src/routes/condition_routes.rs
//
// Conditions and the question bank. The chatbot grows both during ingestion;
// staff curate them here.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean, deserialize_double_option, AppState, OkResponse},
};

const QUESTION_CATEGORY_DEFAULT: &str = "general";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conditions", get(list_conditions).post(create_condition))
        .route(
            "/conditions/{condition_id}",
            axum::routing::patch(update_condition).delete(delete_condition),
        )
        .route("/questions", get(list_questions).post(create_question))
        .route("/questions/{question_id}", axum::routing::patch(update_question))
        .route("/questions/{question_id}/deactivate", post(deactivate_question))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConditionRow {
    pub condition_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct QuestionRow {
    pub question_id: Uuid,
    pub condition_id: Option<Uuid>,
    pub text: String,
    pub category: String,
    pub display_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

fn required(field: &str, raw: &str) -> Result<String, ApiError> {
    clean(Some(raw)).ok_or_else(|| ApiError::validation(format!("{field} is required")))
}

fn conflict_on_name(e: sqlx::Error) -> ApiError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ApiError::Conflict("CONFLICT", "a condition with this name already exists".into())
        }
        _ => ApiError::db(e),
    }
}

/* -------------------------
   Conditions
--------------------------*/

pub async fn list_conditions(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<ConditionRow>>, ApiError> {
    let rows: Vec<ConditionRow> = sqlx::query_as::<_, ConditionRow>(
        r#"
        SELECT condition_id, name, description, created_at
        FROM condition
        ORDER BY lower(name) ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateConditionRequest {
    pub name: String,
    pub description: Option<String>,
}

pub async fn create_condition(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreateConditionRequest>,
) -> Result<Json<ConditionRow>, ApiError> {
    let name = required("name", &req.name)?;

    let row: ConditionRow = sqlx::query_as::<_, ConditionRow>(
        r#"
        INSERT INTO condition (name, description)
        VALUES ($1, $2)
        RETURNING condition_id, name, description, created_at
        "#,
    )
    .bind(&name)
    .bind(clean(req.description.as_deref()))
    .fetch_one(&state.db)
    .await
    .map_err(conflict_on_name)?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConditionRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub description: Option<Option<String>>,
}

pub async fn update_condition(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(condition_id): Path<Uuid>,
    Json(req): Json<UpdateConditionRequest>,
) -> Result<Json<ConditionRow>, ApiError> {
    let name = match req.name.as_deref() {
        Some(raw) => Some(required("name", raw)?),
        None => None,
    };
    let (set_description, description) = match req.description {
        None => (false, None),
        Some(v) => (true, clean(v.as_deref())),
    };

    let row: ConditionRow = sqlx::query_as::<_, ConditionRow>(
        r#"
        UPDATE condition
        SET name = COALESCE($1, name),
            description = CASE WHEN $2 THEN $3 ELSE description END
        WHERE condition_id = $4
        RETURNING condition_id, name, description, created_at
        "#,
    )
    .bind(name)
    .bind(set_description)
    .bind(description)
    .bind(condition_id)
    .fetch_optional(&state.db)
    .await
    .map_err(conflict_on_name)?
    .ok_or_else(|| ApiError::not_found("condition"))?;

    Ok(Json(row))
}

pub async fn delete_condition(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(condition_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let in_use: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM assessment WHERE condition_id = $1)",
    )
    .bind(condition_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    if in_use {
        return Err(ApiError::Conflict(
            "CONDITION_IN_USE",
            "condition is referenced by assessments".into(),
        ));
    }

    // Questions scoped to the condition fall back to unscoped via ON DELETE SET NULL.
    let res = sqlx::query("DELETE FROM condition WHERE condition_id = $1")
        .bind(condition_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("condition"));
    }

    Ok(Json(OkResponse::ok()))
}

/* -------------------------
   Questions
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct QuestionQuery {
    pub condition_id: Option<Uuid>,
    pub include_inactive: Option<bool>,
}

pub async fn list_questions(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<QuestionQuery>,
) -> Result<Json<Vec<QuestionRow>>, ApiError> {
    let rows: Vec<QuestionRow> = sqlx::query_as::<_, QuestionRow>(
        r#"
        SELECT question_id, condition_id, text, category, display_order, is_active, created_at
        FROM question
        WHERE ($1::uuid IS NULL OR condition_id = $1)
          AND ($2 OR is_active = TRUE)
        ORDER BY display_order ASC, created_at ASC
        "#,
    )
    .bind(q.condition_id)
    .bind(q.include_inactive.unwrap_or(false))
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

async fn ensure_condition(state: &AppState, condition_id: Uuid) -> Result<(), ApiError> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM condition WHERE condition_id = $1)")
            .bind(condition_id)
            .fetch_one(&state.db)
            .await
            .map_err(ApiError::db)?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::not_found("condition"))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateQuestionRequest {
    pub condition_id: Option<Uuid>,
    pub text: String,
    pub category: Option<String>,
    pub display_order: Option<i32>,
}

pub async fn create_question(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreateQuestionRequest>,
) -> Result<Json<QuestionRow>, ApiError> {
    let text = required("text", &req.text)?;
    if let Some(cid) = req.condition_id {
        ensure_condition(&state, cid).await?;
    }
    let category =
        clean(req.category.as_deref()).unwrap_or_else(|| QUESTION_CATEGORY_DEFAULT.to_string());

    let row: QuestionRow = sqlx::query_as::<_, QuestionRow>(
        r#"
        INSERT INTO question (condition_id, text, category, display_order)
        VALUES ($1, $2, $3, $4)
        RETURNING question_id, condition_id, text, category, display_order, is_active, created_at
        "#,
    )
    .bind(req.condition_id)
    .bind(&text)
    .bind(&category)
    .bind(req.display_order.unwrap_or(0))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuestionRequest {
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub condition_id: Option<Option<Uuid>>,
    pub text: Option<String>,
    pub category: Option<String>,
    pub display_order: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_question(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(question_id): Path<Uuid>,
    Json(req): Json<UpdateQuestionRequest>,
) -> Result<Json<QuestionRow>, ApiError> {
    let text = match req.text.as_deref() {
        Some(raw) => Some(required("text", raw)?),
        None => None,
    };
    let category = match req.category.as_deref() {
        Some(raw) => Some(required("category", raw)?),
        None => None,
    };
    let (set_condition, condition_id) = match req.condition_id {
        None => (false, None),
        Some(v) => (true, v),
    };
    if let Some(cid) = condition_id {
        ensure_condition(&state, cid).await?;
    }

    let row: QuestionRow = sqlx::query_as::<_, QuestionRow>(
        r#"
        UPDATE question
        SET text = COALESCE($1, text),
            category = COALESCE($2, category),
            display_order = COALESCE($3, display_order),
            is_active = COALESCE($4, is_active),
            condition_id = CASE WHEN $5 THEN $6 ELSE condition_id END
        WHERE question_id = $7
        RETURNING question_id, condition_id, text, category, display_order, is_active, created_at
        "#,
    )
    .bind(text)
    .bind(category)
    .bind(req.display_order)
    .bind(req.is_active)
    .bind(set_condition)
    .bind(condition_id)
    .bind(question_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("question"))?;

    Ok(Json(row))
}

pub async fn deactivate_question(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(question_id): Path<Uuid>,
) -> Result<Json<QuestionRow>, ApiError> {
    let row: QuestionRow = sqlx::query_as::<_, QuestionRow>(
        r#"
        UPDATE question
        SET is_active = FALSE
        WHERE question_id = $1
        RETURNING question_id, condition_id, text, category, display_order, is_active, created_at
        "#,
    )
    .bind(question_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("question"))?;

    Ok(Json(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields_are_trimmed() {
        assert_eq!(required("name", "  Asthma ").unwrap(), "Asthma");
        let err = required("text", " \t").unwrap_err();
        assert_eq!(err.to_string(), "VALIDATION_ERROR: text is required");
    }

    #[test]
    fn question_patch_can_unscope_a_question() {
        let req: UpdateQuestionRequest =
            serde_json::from_str(r#"{"condition_id":null,"display_order":3}"#).unwrap();
        assert_eq!(req.condition_id, Some(None));
        assert_eq!(req.display_order, Some(3));
        assert!(req.text.is_none());
    }
}
