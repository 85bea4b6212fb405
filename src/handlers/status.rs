use axum::Json;
use axum::extract::State;

use crate::orchestrator::StatusSnapshot;
use crate::state::AppState;

pub async fn status_handler(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.status().await)
}
