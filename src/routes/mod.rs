use crate::models::AppState;
use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

pub mod analytics_routes;
pub mod assessment_routes;
pub mod auth_routes;
pub mod clinic_routes;
pub mod communication_routes;
pub mod condition_routes;
pub mod follow_up_routes;
pub mod live_routes;
pub mod patient_routes;
pub mod webhook_routes;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(clinic_routes::router())
        .merge(patient_routes::router())
        .merge(condition_routes::router())
        .merge(assessment_routes::router())
        .merge(communication_routes::router())
        .merge(follow_up_routes::router())
        .merge(analytics_routes::router())
        .merge(webhook_routes::router())
        .merge(live_routes::router());

    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1", api)
        .route("/health", get(health))
        .with_state(state)
}

/// Liveness check; never touches the database.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "ok": true,
            "live_connections": state.live.connection_count(),
        }
    }))
}
