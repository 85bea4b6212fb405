use crate::orchestrator::Orchestrator;

// app's shared state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}
