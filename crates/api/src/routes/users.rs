//! User registration and saga inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::Handle;
use replication::SagaRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct RegisteredResponse {
    pub handle: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub handle: String,
    pub state: String,
    pub expected: Vec<String>,
    pub committed: Vec<String>,
    pub compensated: Vec<String>,
    pub failed_participant: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SagaStatusResponse {
    fn from_record(handle: Handle, record: &SagaRecord) -> Self {
        let names = |set: &std::collections::BTreeSet<common::ParticipantId>| {
            set.iter().map(|p| p.to_string()).collect::<Vec<_>>()
        };
        Self {
            handle: handle.to_string(),
            state: record.state().to_string(),
            expected: names(record.expected()),
            committed: names(record.committed()),
            compensated: names(record.compensated()),
            failed_participant: record.failed_participant().map(|p| p.to_string()),
            failure_reason: record.failure_reason().map(str::to_string),
            started_at: record.started_at(),
            updated_at: record.updated_at(),
        }
    }
}

/// POST /users — registers a user and starts replicating it.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisteredResponse>), ApiError> {
    let user = state.registration.register(&req.email).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisteredResponse {
            handle: user.handle.to_string(),
            email: user.email,
            created_at: user.created_at,
        }),
    ))
}

/// GET /users/{handle}/saga — returns the replication saga of a user.
pub async fn saga_status(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<Uuid>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let handle = Handle::from_uuid(handle);
    let record = state
        .tracker
        .get(handle)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No saga found for user {handle}")))?;

    Ok(Json(SagaStatusResponse::from_record(handle, &record)))
}
