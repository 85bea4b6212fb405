pub mod backend;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod state;
pub mod state_store;

pub use error::{BackendError, GenerateError};
pub use orchestrator::{GenerationWorker, Orchestrator, OrchestratorBuilder};
