use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

use crate::error::GenerateError;
use crate::metrics::QUEUE_DEPTH;
use crate::models::{GenerationResult, QueueItem};

pub type Deferred = oneshot::Receiver<Result<GenerationResult, GenerateError>>;

// Counters shared between the submitting side and the drain side
#[derive(Default)]
struct QueueStats {
    // items submitted whose continuation has not fired yet (includes the running one)
    pending: AtomicUsize,
    running: AtomicBool,
    next_job_id: AtomicU64,
}

/// Submitting half of the FIFO queue. Cheap to clone.
#[derive(Clone)]
pub struct SubmissionQueue {
    tx: mpsc::Sender<QueueItem>,
    stats: Arc<QueueStats>,
}

/// Draining half. Exactly one exists, owned by the worker, which is what
/// makes execution single-flight.
pub struct QueueDrain {
    rx: mpsc::Receiver<QueueItem>,
    stats: Arc<QueueStats>,
}

pub fn submission_queue(capacity: usize) -> (SubmissionQueue, QueueDrain) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    (
        SubmissionQueue {
            tx,
            stats: stats.clone(),
        },
        QueueDrain { rx, stats },
    )
}

impl SubmissionQueue {
    pub fn next_job_id(&self) -> u64 {
        self.stats.next_job_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Append a job and hand back the receiver its result will arrive on.
    pub async fn enqueue(&self, job_id: u64, prompt: String) -> Result<Deferred, GenerateError> {
        // no await between counting the job and handing it over, so a
        // caller dropped while the channel is full leaves no trace
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| GenerateError::WorkerUnavailable)?;

        let (response_tx, response_rx) = oneshot::channel();
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        permit.send(QueueItem {
            job_id,
            prompt,
            response_tx,
        });
        QUEUE_DEPTH.set(self.waiting() as f64);
        Ok(response_rx)
    }

    pub fn is_running(&self) -> bool {
        self.stats.running.load(Ordering::SeqCst)
    }

    /// Jobs submitted but not yet picked up by the worker.
    pub fn waiting(&self) -> usize {
        waiting(&self.stats)
    }
}

impl QueueDrain {
    /// Pop the oldest job, waiting for one if the queue is empty. The job
    /// counts as running until [`QueueDrain::finish`] is called with it.
    pub async fn drain_next(&mut self) -> Option<QueueItem> {
        let item = self.rx.recv().await?;
        self.stats.running.store(true, Ordering::SeqCst);
        QUEUE_DEPTH.set(waiting(&self.stats) as f64);
        Some(item)
    }

    /// Fire the job's continuation, then release the single-flight slot.
    pub fn finish(&self, item: QueueItem, outcome: Result<GenerationResult, GenerateError>) {
        // the caller may have gone away; the job still counts as done
        let _ = item.response_tx.send(outcome);
        self.stats.pending.fetch_sub(1, Ordering::SeqCst);
        self.stats.running.store(false, Ordering::SeqCst);
        QUEUE_DEPTH.set(waiting(&self.stats) as f64);
    }

    pub fn waiting(&self) -> usize {
        waiting(&self.stats)
    }
}

fn waiting(stats: &QueueStats) -> usize {
    let pending = stats.pending.load(Ordering::SeqCst);
    let running = usize::from(stats.running.load(Ordering::SeqCst));
    pending.saturating_sub(running)
}
