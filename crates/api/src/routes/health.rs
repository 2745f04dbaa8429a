//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub participants: Vec<String>,
}

/// GET /health — returns service status and the participants sagas expect.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        participants: state
            .tracker
            .participants()
            .iter()
            .map(|p| p.to_string())
            .collect(),
    })
}
