//! HTTP surface of the imagine generation service.

pub mod auth;
pub mod error;
pub mod server;
pub mod system;

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use imagine_core::{
    api::{GenerateBody, HealthReport, ModelDetail, ReloadReport, ServerInfo},
    GenerationRequest,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use server::{GenerationServer, DEFAULT_MAX_CONCURRENT_GENERATIONS};

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<GenerationServer>,
    /// Bearer token required on every route, if set.
    pub auth_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(server: GenerationServer, auth_token: Option<String>) -> Self {
        Self {
            server: Arc::new(server),
            auth_token: auth_token.map(Arc::from),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/model_info/{name}", get(model_info))
        .route("/reload_model/{name}", post(reload_model))
        .route("/imagine/{name}", post(imagine))
        .route("/generate", post(generate))
        .route("/auth", get(auth_check))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.server.health().await)
}

async fn info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(state.server.info().await)
}

async fn model_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ModelDetail>, ApiError> {
    Ok(Json(state.server.model_info(&name).await?))
}

async fn reload_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ReloadReport>, ApiError> {
    Ok(Json(state.server.reload_model(&name).await?))
}

async fn imagine(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<GenerationRequest>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(request) = query.map_err(|rejection| ApiError::Malformed(rejection.body_text()))?;
    let png = state.server.generate(Some(&name), &request).await?;
    Ok(png_response(png))
}

async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Malformed(rejection.body_text()))?;
    let png = state
        .server
        .generate(body.model.as_deref(), &body.request)
        .await?;
    Ok(png_response(png))
}

async fn auth_check() -> Json<Value> {
    Json(json!({ "authenticated": true }))
}

fn png_response(png: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], png).into_response()
}
