use axum::{Json, extract::State};
use std::time::Instant;

use crate::error::GenerateError;
use crate::metrics::REQUEST_LATENCY;
use crate::models::{GenerateRequest, GenerateResponse};
use crate::state::AppState;

pub async fn generate_handler(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, GenerateError> {
    let start_time = Instant::now();

    let result = state.orchestrator.submit(&payload.prompt).await;

    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());

    result.map(|r| Json(r.into()))
}
