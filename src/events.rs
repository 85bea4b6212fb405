use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

// Where a submission currently is in the orchestrator's state machine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobPhase {
    CacheCheck,
    Resolved,
    Queued { position: usize },
    Running { attempt: u32 },
    Retrying {
        attempt: u32,
        max_attempts: u32,
        #[serde(with = "millis")]
        delay: Duration,
    },
    Succeeded { elapsed_ms: u64 },
    Failed { message: String, attempts: u32 },
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Resolved | JobPhase::Succeeded { .. } | JobPhase::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    Phase {
        job_id: u64,
        prompt: String,
        phase: JobPhase,
    },
    Progress {
        job_id: u64,
        percent: f64,
        eta: String,
    },
}

impl OrchestratorEvent {
    pub fn job_id(&self) -> u64 {
        match self {
            OrchestratorEvent::Phase { job_id, .. } | OrchestratorEvent::Progress { job_id, .. } => {
                *job_id
            }
        }
    }
}

/// Fan-out of orchestrator events to any number of subscribers.
///
/// Slow subscribers lose the oldest events (`RecvError::Lagged`); the
/// orchestrator never waits on them.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        // only fails when nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_millis() as u64)
    }
}
