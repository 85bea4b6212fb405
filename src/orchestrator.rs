//! The generation state machine.
//!
//! A submission is validated and checked against the cache on the caller's
//! task. Misses go through the [`SubmissionQueue`] to the one
//! [`GenerationWorker`], which runs jobs strictly one at a time:
//!
//! ```text
//! CacheCheck -> Resolved (hit)
//!            -> Queued -> Running -> Succeeded
//!                                 -> Retrying -> Running ...
//!                                 -> Failed
//! ```

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast, watch};

use crate::backend::ImageBackend;
use crate::cache::CacheStore;
use crate::classifier::{Classification, classify};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::connectivity::Connectivity;
use crate::error::{BackendError, GenerateError};
use crate::events::{EventBus, JobPhase, OrchestratorEvent};
use crate::ledger::RecentPrompts;
use crate::metrics::{
    BACKEND_RETRIES, CACHE_HITS, CACHE_MISSES, CACHE_SIZE, GENERATION_FAILURES, REQUEST_TOTAL,
};
use crate::models::{BackendImage, GenerationResult, ImageRecord, QueueItem};
use crate::persistence::{ImageSink, NullSink};
use crate::progress::{
    FIRST_ATTEMPT_ETA, IntervalTicks, ProgressEstimator, TickSource, retry_eta,
};
use crate::queue::{QueueDrain, SubmissionQueue, submission_queue};
use crate::state_store::{MemoryStateStore, PersistedState, StateStore, state_writer};

struct Inner {
    config: OrchestratorConfig,
    cache: CacheStore,
    recent: Mutex<RecentPrompts>,
    queue: SubmissionQueue,
    events: EventBus,
    connectivity: Arc<Connectivity>,
    backend: Arc<dyn ImageBackend>,
    sink: Arc<dyn ImageSink>,
    snapshots: watch::Sender<Option<PersistedState>>,
    ticks: Arc<dyn TickSource>,
}

impl Inner {
    fn phase(&self, job_id: u64, prompt: &str, phase: JobPhase) {
        self.events.publish(OrchestratorEvent::Phase {
            job_id,
            prompt: prompt.to_string(),
            phase,
        });
    }

    /// Record `prompt` in the recent list and, if anything changed, hand a
    /// snapshot to the state writer. Snapshots are published under the
    /// ledger lock, so the writer never sees an older one after a newer one.
    async fn commit(&self, prompt: Option<&str>, cache_changed: bool) {
        let mut recent = self.recent.lock().await;
        let ledger_changed = prompt.is_some_and(|p| recent.record(p));
        CACHE_SIZE.set(self.cache.len() as f64);

        if !(ledger_changed || cache_changed) {
            return;
        }

        let state = PersistedState {
            cache: self.cache.snapshot(),
            recent_prompts: recent.to_vec(),
        };
        self.snapshots.send_replace(Some(state));
    }

    async fn call_backend(&self, prompt: &str) -> Result<BackendImage, BackendError> {
        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.backend.generate(prompt))
                .await
                .unwrap_or(Err(BackendError::Timeout(limit))),
            None => self.backend.generate(prompt).await,
        }
    }

    /// The retry loop. `retries` is bumped before every backoff so the
    /// progress side can show which retry is underway.
    async fn run_attempts(
        &self,
        job_id: u64,
        prompt: &str,
        retries: &AtomicU32,
    ) -> Result<(BackendImage, u32), (Classification, u32)> {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 1;

        loop {
            self.phase(job_id, prompt, JobPhase::Running { attempt });

            let err = match self.call_backend(prompt).await {
                Ok(body) => return Ok((body, attempt)),
                Err(e) => e,
            };

            let classification = classify(&err, self.connectivity.is_online());
            tracing::warn!(
                job_id,
                attempt,
                category = ?classification.category,
                error = %err,
                "Generation attempt failed",
            );

            if !classification.retryable || attempt >= max_attempts {
                return Err((classification, attempt));
            }

            let delay = self.config.backoff_delay(attempt);
            BACKEND_RETRIES.inc();
            retries.store(attempt, Ordering::SeqCst);
            self.phase(
                job_id,
                prompt,
                JobPhase::Retrying {
                    attempt,
                    max_attempts,
                    delay,
                },
            );
            tracing::info!(job_id, attempt, delay_ms = delay.as_millis() as u64, "Retrying generation");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub fn failure_message(classification: &Classification, attempts: u32) -> String {
    if attempts > 1 {
        format!(
            "Generation failed after {attempts} attempts. {}",
            classification.user_message
        )
    } else {
        classification.user_message.clone()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub queue_depth: usize,
    pub online: bool,
    pub cache_size: usize,
    pub recent_prompts: Vec<String>,
}

/// Handle used to submit prompts. Cheap to clone; every clone talks to the
/// same worker.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(backend: Arc<dyn ImageBackend>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(backend)
    }

    /// Submit a prompt and wait for its image.
    ///
    /// Cache hits return immediately without touching the queue. Identical
    /// prompts that are already queued are not merged; each runs on its own
    /// once it reaches the front.
    pub async fn submit(&self, prompt: &str) -> Result<GenerationResult, GenerateError> {
        REQUEST_TOTAL.inc();
        let inner = &self.inner;

        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }

        let job_id = inner.queue.next_job_id();
        inner.phase(job_id, prompt, JobPhase::CacheCheck);

        let (hit, evicted) = inner.cache.lookup(prompt);
        if let Some(entry) = hit {
            CACHE_HITS.inc();
            tracing::debug!(job_id, key = %entry.key, "Cache HIT");
            inner.commit(Some(prompt), false).await;
            inner.phase(job_id, prompt, JobPhase::Resolved);
            return Ok(GenerationResult {
                image: entry.image,
                elapsed_ms: 0,
                persisted_id: None,
                cached: true,
                attempts: 0,
            });
        }

        CACHE_MISSES.inc();
        if evicted {
            tracing::debug!(job_id, "Evicted expired cache entry");
            inner.commit(None, true).await;
        }

        if inner.queue.is_running() {
            let position = inner.queue.waiting() + 1;
            inner.phase(job_id, prompt, JobPhase::Queued { position });
        }

        let deferred = inner.queue.enqueue(job_id, prompt.to_string()).await?;
        deferred
            .await
            .map_err(|_| GenerateError::WorkerUnavailable)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn connectivity(&self) -> Arc<Connectivity> {
        self.inner.connectivity.clone()
    }

    pub async fn recent_prompts(&self) -> Vec<String> {
        self.inner.recent.lock().await.to_vec()
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.inner.queue.is_running(),
            queue_depth: self.inner.queue.waiting(),
            online: self.inner.connectivity.is_online(),
            cache_size: self.inner.cache.len(),
            recent_prompts: self.recent_prompts().await,
        }
    }
}

/// Owns the draining end of the queue; run it on exactly one task.
pub struct GenerationWorker {
    inner: Arc<Inner>,
    drain: QueueDrain,
    estimator: ProgressEstimator,
}

impl GenerationWorker {
    pub async fn run(mut self) {
        tracing::info!("Generation worker started - processing jobs one at a time");

        while let Some(item) = self.drain.drain_next().await {
            let outcome = self.process(&item).await;
            self.drain.finish(item, outcome);
        }

        tracing::info!("Generation worker stopped");
    }

    async fn process(&mut self, item: &QueueItem) -> Result<GenerationResult, GenerateError> {
        let inner = &self.inner;
        let estimator = &mut self.estimator;
        let job_id = item.job_id;
        let max_attempts = inner.config.max_attempts;
        let started = Instant::now();

        tracing::info!(job_id, prompt = %item.prompt, "Cache MISS - calling backend");

        estimator.reset();
        let retries = AtomicU32::new(0);
        let mut ticker = inner.ticks.ticker();

        let attempts = inner.run_attempts(job_id, &item.prompt, &retries);
        tokio::pin!(attempts);

        // progress ticks until the retry loop resolves, backoff waits included
        let outcome = loop {
            tokio::select! {
                outcome = &mut attempts => break outcome,
                _ = ticker.tick() => {
                    let percent = estimator.advance();
                    let eta = match retries.load(Ordering::SeqCst) {
                        0 => FIRST_ATTEMPT_ETA.to_string(),
                        n => retry_eta(n, max_attempts),
                    };
                    inner.events.publish(OrchestratorEvent::Progress { job_id, percent, eta });
                }
            }
        };

        match outcome {
            Ok((body, attempts)) => {
                let image = body.artifact();
                inner.cache.put(&item.prompt, image.clone());
                inner.commit(Some(&item.prompt), true).await;

                let sink = inner.sink.clone();
                let record = ImageRecord {
                    prompt: item.prompt.clone(),
                    image: body.image.clone(),
                    mime_type: body.mime_type.clone(),
                    elapsed_ms: body.elapsed_ms,
                    is_favorite: false,
                };
                tokio::spawn(async move {
                    if let Err(e) = sink.record(record).await {
                        tracing::warn!(job_id, error = %e, "Failed to persist generated image");
                    }
                });

                let percent = estimator.complete();
                inner.events.publish(OrchestratorEvent::Progress {
                    job_id,
                    percent,
                    eta: String::new(),
                });
                estimator.reset();

                tracing::info!(
                    job_id,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Generation succeeded",
                );
                inner.phase(
                    job_id,
                    &item.prompt,
                    JobPhase::Succeeded {
                        elapsed_ms: body.elapsed_ms,
                    },
                );

                Ok(GenerationResult {
                    image,
                    elapsed_ms: body.elapsed_ms,
                    persisted_id: body.persisted_id,
                    cached: false,
                    attempts,
                })
            }
            Err((classification, attempts)) => {
                estimator.reset();
                GENERATION_FAILURES.inc();

                let message = failure_message(&classification, attempts);
                tracing::error!(
                    job_id,
                    attempts,
                    category = ?classification.category,
                    "Generation failed: {message}",
                );
                inner.phase(
                    job_id,
                    &item.prompt,
                    JobPhase::Failed {
                        message: message.clone(),
                        attempts,
                    },
                );

                Err(GenerateError::Failed {
                    category: classification.category,
                    message,
                    attempts,
                })
            }
        }
    }
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    backend: Arc<dyn ImageBackend>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ImageSink>,
    store: Arc<dyn StateStore>,
    connectivity: Arc<Connectivity>,
    ticks: Option<Arc<dyn TickSource>>,
    progress_seed: Option<u64>,
}

impl OrchestratorBuilder {
    pub fn new(backend: Arc<dyn ImageBackend>) -> Self {
        Self {
            config: OrchestratorConfig::default(),
            backend,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NullSink),
            store: Arc::new(MemoryStateStore::default()),
            connectivity: Arc::new(Connectivity::new()),
            ticks: None,
            progress_seed: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ImageSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Defaults to a real interval of `config.progress_interval`.
    pub fn tick_source(mut self, ticks: Arc<dyn TickSource>) -> Self {
        self.ticks = Some(ticks);
        self
    }

    pub fn progress_seed(mut self, seed: u64) -> Self {
        self.progress_seed = Some(seed);
        self
    }

    /// Load local state, start the state writer and wire up the queue.
    /// Unreadable state is logged and replaced by an empty one.
    pub async fn build(self) -> (Orchestrator, GenerationWorker) {
        let state = self.store.load().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load local state, starting empty");
            PersistedState::default()
        });

        let cache = CacheStore::new(self.config.cache_ttl, self.clock);
        let restored = cache.restore(state.cache.into_values());
        let recent = RecentPrompts::from_saved(state.recent_prompts, self.config.recent_capacity);
        CACHE_SIZE.set(restored as f64);
        tracing::info!(
            cached = restored,
            recent = recent.len(),
            "Loaded local state"
        );

        let (snapshots, snapshot_rx) = watch::channel(None);
        tokio::spawn(state_writer(self.store, snapshot_rx));

        let (queue, drain) = submission_queue(self.config.queue_capacity);
        let ticks = self
            .ticks
            .unwrap_or_else(|| Arc::new(IntervalTicks::new(self.config.progress_interval)));
        let estimator = match self.progress_seed {
            Some(seed) => ProgressEstimator::with_seed(seed),
            None => ProgressEstimator::new(),
        };

        let inner = Arc::new(Inner {
            config: self.config,
            cache,
            recent: Mutex::new(recent),
            queue,
            events: EventBus::default(),
            connectivity: self.connectivity,
            backend: self.backend,
            sink: self.sink,
            snapshots,
            ticks,
        });

        let worker = GenerationWorker {
            inner: inner.clone(),
            drain,
            estimator,
        };
        (Orchestrator { inner }, worker)
    }

    /// Build and spawn the worker on the current runtime.
    pub async fn spawn(self) -> Orchestrator {
        let (orchestrator, worker) = self.build().await;
        tokio::spawn(worker.run());
        orchestrator
    }
}
