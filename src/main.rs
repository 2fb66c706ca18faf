mod auth;
mod config;
mod middleware;

mod db;
mod error;
mod ingest;
mod live;
mod models;
mod routes;

use std::sync::Arc;

use crate::{
    config::Config,
    live::LiveHub,
    models::{AppState, AuthSettings},
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::{HeaderName, header};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    if cfg.auth_disabled {
        tracing::warn!("AUTH_DISABLED is set: every caller is treated as signed in");
    }
    if cfg.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET is not set: the chatbot webhook accepts any caller");
    }

    let state = AppState {
        db: pool,
        live: LiveHub::new(cfg.live_channel_capacity),
        auth: Arc::new(AuthSettings {
            password_hash: cfg.admin_password_hash.clone(),
            disabled: cfg.auth_disabled,
            session_ttl_hours: cfg.session_ttl_hours,
            cookie_secure: cfg.cookie_secure,
        }),
        webhook_secret: cfg.webhook_secret.as_deref().map(Arc::from),
    };

    // The dashboard SPA is served from another origin during development.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(routes::webhook_routes::WEBHOOK_SECRET_HEADER),
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
