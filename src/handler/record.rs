use std::path::PathBuf;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Serialize;

use crate::{
    handler::ApiJsonResult,
    recorder::{RecorderStatus, get_recorder},
};

pub fn record_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/prepare", post(prepare))
        .route("/begin", post(begin))
        .route("/end", post(end))
        .route("/revoke", post(revoke))
        .route("/status", get(status))
        .route("/latest", get(latest))
}

#[derive(Serialize)]
struct PrepareResponse {
    audio_permitted: bool,
}

#[derive(Serialize)]
struct PathResponse {
    path: Option<PathBuf>,
}

async fn index() -> &'static str {
    "record route!"
}

async fn prepare() -> ApiJsonResult<PrepareResponse> {
    let audio_permitted = get_recorder().prepare().await?;
    Ok(Json(PrepareResponse { audio_permitted }))
}

async fn begin() -> ApiJsonResult<PathResponse> {
    let path = get_recorder().begin().await?;
    Ok(Json(PathResponse { path: Some(path) }))
}

async fn end() -> ApiJsonResult<PathResponse> {
    let path = get_recorder().end().await?;
    Ok(Json(PathResponse { path }))
}

async fn revoke() -> ApiJsonResult<String> {
    get_recorder().revoke().await;
    Ok(Json("success".to_string()))
}

async fn status() -> Json<RecorderStatus> {
    Json(get_recorder().status().await)
}

async fn latest() -> ApiJsonResult<PathResponse> {
    let path = get_recorder().storage().latest_recording()?;
    Ok(Json(PathResponse { path }))
}
