use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use imagner_gateway::backend::ImageBackend;
use imagner_gateway::cache::CacheEntry;
use imagner_gateway::classifier::ErrorCategory;
use imagner_gateway::clock::ManualClock;
use imagner_gateway::config::OrchestratorConfig;
use imagner_gateway::error::{BackendError, GenerateError, StoreError};
use imagner_gateway::events::{JobPhase, OrchestratorEvent};
use imagner_gateway::models::{BackendImage, ImageArtifact, ImageRecord};
use imagner_gateway::orchestrator::Orchestrator;
use imagner_gateway::persistence::ImageSink;
use imagner_gateway::state_store::{MemoryStateStore, PersistedState, StateStore};

enum Step {
    Succeed,
    Fail(BackendError),
    Hang(Duration),
}

#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(String, Instant)>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl ImageBackend for ScriptedBackend {
    async fn generate(&self, prompt: &str) -> Result<BackendImage, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outcome = match step {
            Step::Succeed => Ok(image_for(prompt)),
            Step::Fail(err) => Err(err),
            Step::Hang(d) => {
                tokio::time::sleep(d).await;
                Ok(image_for(prompt))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn image_for(prompt: &str) -> BackendImage {
    BackendImage {
        image: format!("img:{prompt}"),
        mime_type: "image/png".to_string(),
        elapsed_ms: 250,
        persisted_id: Some(format!("id:{prompt}")),
    }
}

fn unavailable() -> BackendError {
    BackendError::Http {
        status: 503,
        message: "Service Unavailable".to_string(),
    }
}

async fn start(backend: Arc<ScriptedBackend>) -> Orchestrator {
    Orchestrator::builder(backend).progress_seed(11).spawn().await
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn identical_prompt_is_served_from_cache() {
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = start(backend.clone()).await;

    let first = orchestrator.submit("a red bicycle").await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.persisted_id.as_deref(), Some("id:a red bicycle"));

    let second = orchestrator.submit("  A Red Bicycle ").await.unwrap();
    assert!(second.cached);
    assert_eq!(second.image, first.image);
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_triggers_a_fresh_call() {
    let backend = ScriptedBackend::new(vec![]);
    let clock = Arc::new(ManualClock::default());
    let orchestrator = Orchestrator::builder(backend.clone())
        .clock(clock.clone())
        .spawn()
        .await;

    orchestrator.submit("cat").await.unwrap();
    clock.advance(Duration::from_secs(24 * 60 * 60));

    let again = orchestrator.submit("cat").await.unwrap();
    assert!(!again.cached);
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn queued_jobs_run_one_at_a_time_in_order() {
    let backend = ScriptedBackend::with_latency(Duration::from_millis(500));
    let orchestrator = start(backend.clone()).await;
    let mut events = orchestrator.subscribe();

    let prompts = ["first", "second", "third", "fourth", "fifth"];
    let mut handles = Vec::new();
    for prompt in prompts {
        let o = orchestrator.clone();
        handles.push(tokio::spawn(async move { o.submit(prompt).await }));
        // let the task enqueue before the next one is spawned
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let status = orchestrator.status().await;
    assert!(status.running);
    assert_eq!(status.queue_depth, 4);

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(backend.prompts(), prompts);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);

    let queued: Vec<usize> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Phase {
                phase: JobPhase::Queued { position },
                ..
            } => Some(position),
            _ => None,
        })
        .collect();
    assert_eq!(queued, vec![1, 2, 3, 4]);
    assert!(!orchestrator.status().await.running);
}

#[tokio::test(start_paused = true)]
async fn duplicates_in_the_queue_each_run() {
    let backend = ScriptedBackend::with_latency(Duration::from_millis(200));
    let orchestrator = start(backend.clone()).await;

    let mut handles = Vec::new();
    for prompt in ["blocker", "fox", "fox"] {
        let o = orchestrator.clone();
        handles.push(tokio::spawn(async move { o.submit(prompt).await }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(backend.prompts(), vec!["blocker", "fox", "fox"]);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
    let backend = ScriptedBackend::new(vec![Step::Fail(unavailable()), Step::Fail(unavailable())]);
    let orchestrator = start(backend.clone()).await;
    let mut events = orchestrator.subscribe();

    let result = orchestrator.submit("a lighthouse").await.unwrap();
    assert_eq!(result.attempts, 3);
    assert!(!result.cached);

    let times = backend.call_times();
    assert_eq!(times.len(), 3);
    assert_eq!(times[1] - times[0], Duration::from_secs(1));
    assert_eq!(times[2] - times[1], Duration::from_secs(2));

    let delays: Vec<Duration> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Phase {
                phase: JobPhase::Retrying { delay, .. },
                ..
            } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_attempt_count() {
    let backend = ScriptedBackend::new(vec![
        Step::Fail(unavailable()),
        Step::Fail(unavailable()),
        Step::Fail(unavailable()),
    ]);
    let orchestrator = start(backend.clone()).await;

    let err = orchestrator.submit("a storm").await.unwrap_err();
    match err {
        GenerateError::Failed {
            category,
            message,
            attempts,
        } => {
            assert_eq!(category, ErrorCategory::ServerError);
            assert_eq!(attempts, 3);
            assert!(message.contains("after 3 attempts"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.call_count(), 3);

    // nothing cached for a failed prompt
    orchestrator.submit("a storm").await.unwrap();
    assert_eq!(backend.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn quota_error_fails_after_one_attempt_without_waiting() {
    let backend = ScriptedBackend::new(vec![Step::Fail(BackendError::Http {
        status: 402,
        message: "Monthly quota exceeded".to_string(),
    })]);
    let orchestrator = start(backend.clone()).await;

    let started = Instant::now();
    let err = orchestrator.submit("a castle").await.unwrap_err();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(backend.call_count(), 1);
    assert_eq!(err.category(), Some(ErrorCategory::QuotaExceeded));
    assert!(err.to_string().contains("quota exceeded"));
}

#[tokio::test(start_paused = true)]
async fn offline_failures_are_not_retried() {
    let backend = ScriptedBackend::new(vec![Step::Fail(BackendError::Network(
        "connection refused".into(),
    ))]);
    let orchestrator = start(backend.clone()).await;
    orchestrator.connectivity().set_online(false);

    let err = orchestrator.submit("a harbor").await.unwrap_err();
    assert_eq!(err.category(), Some(ErrorCategory::Offline));
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_prompt_is_rejected_before_the_queue() {
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = start(backend.clone()).await;
    let mut events = orchestrator.subscribe();

    assert!(matches!(
        orchestrator.submit("   ").await,
        Err(GenerateError::EmptyPrompt)
    ));
    assert_eq!(backend.call_count(), 0);
    assert!(drain_events(&mut events).is_empty());
    assert!(orchestrator.recent_prompts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn recent_prompts_are_deduplicated_most_recent_first() {
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = start(backend.clone()).await;

    for prompt in ["cat", "dog", "cat"] {
        orchestrator.submit(prompt).await.unwrap();
    }

    assert_eq!(orchestrator.recent_prompts().await, vec!["cat", "dog"]);
    // the second "cat" was a cache hit
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn progress_ticks_stay_below_100_until_done() {
    let backend = ScriptedBackend::with_latency(Duration::from_millis(3500));
    let orchestrator = start(backend.clone()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.submit("a slow sunset").await.unwrap();

    let progress: Vec<(f64, String)> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Progress { percent, eta, .. } => Some((percent, eta)),
            _ => None,
        })
        .collect();

    // three one-second ticks while waiting, then the completion tick
    assert_eq!(progress.len(), 4);
    let waiting = &progress[..3];
    for pair in waiting.windows(2) {
        assert!(pair[1].0 >= pair[0].0);
    }
    assert!(waiting.iter().all(|(p, eta)| *p <= 90.0 && eta == "~10-15 seconds"));
    assert_eq!(progress[3].0, 100.0);
}

#[tokio::test(start_paused = true)]
async fn retry_progress_shows_retry_eta() {
    let backend = ScriptedBackend::new(vec![
        Step::Fail(unavailable()),
        Step::Hang(Duration::from_millis(1500)),
    ]);
    let orchestrator = start(backend.clone()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.submit("a comet").await.unwrap();

    // ticks at 1s and 2s both land after the first retry was scheduled
    let etas: Vec<String> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Progress { eta, .. } if !eta.is_empty() => Some(eta),
            _ => None,
        })
        .collect();
    assert_eq!(etas, vec!["Retrying... (1/3)", "Retrying... (1/3)"]);
}

#[tokio::test(start_paused = true)]
async fn hung_attempt_times_out_and_is_retried() {
    let backend = ScriptedBackend::new(vec![Step::Hang(Duration::from_secs(600))]);
    let orchestrator = Orchestrator::builder(backend.clone())
        .config(OrchestratorConfig {
            attempt_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        })
        .spawn()
        .await;

    let started = Instant::now();
    let result = orchestrator.submit("a glacier").await.unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(started.elapsed(), Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn state_is_saved_and_reloaded() {
    let store = Arc::new(MemoryStateStore::default());
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = Orchestrator::builder(backend.clone())
        .state_store(store.clone())
        .spawn()
        .await;

    orchestrator.submit("A Red Bicycle").await.unwrap();
    // let the state writer catch up
    tokio::time::sleep(Duration::from_millis(1)).await;

    let saved = store.current();
    assert!(saved.cache.contains_key("a red bicycle"));
    assert_eq!(saved.recent_prompts, vec!["A Red Bicycle"]);

    // a restarted process answers from the saved cache
    let backend_after_restart = ScriptedBackend::new(vec![]);
    let restarted = Orchestrator::builder(backend_after_restart.clone())
        .state_store(store.clone())
        .spawn()
        .await;

    assert!(restarted.submit("a red bicycle").await.unwrap().cached);
    assert_eq!(backend_after_restart.call_count(), 0);
    assert_eq!(restarted.recent_prompts().await, vec!["a red bicycle", "A Red Bicycle"]);
}

#[tokio::test(start_paused = true)]
async fn stale_entries_are_dropped_on_load() {
    let clock = Arc::new(ManualClock::default());
    let mut state = PersistedState::default();
    state.cache.insert(
        "old".to_string(),
        CacheEntry {
            key: "old".to_string(),
            image: ImageArtifact {
                data: "stale".to_string(),
                mime_type: "image/png".to_string(),
            },
            created_at: chrono::Utc::now() - chrono::Duration::hours(30),
        },
    );
    let store = Arc::new(MemoryStateStore::with_state(state));
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = Orchestrator::builder(backend.clone())
        .clock(clock)
        .state_store(store)
        .spawn()
        .await;

    assert_eq!(orchestrator.status().await.cache_size, 0);
    assert!(!orchestrator.submit("old").await.unwrap().cached);
    assert_eq!(backend.call_count(), 1);
}

// Takes a minute per write
#[derive(Default)]
struct SlowStore {
    inner: MemoryStateStore,
}

#[async_trait]
impl StateStore for SlowStore {
    async fn load(&self) -> Result<PersistedState, StoreError> {
        self.inner.load().await
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        self.inner.save(state).await
    }
}

#[tokio::test(start_paused = true)]
async fn slow_state_writes_do_not_hold_up_submissions() {
    let store = Arc::new(SlowStore::default());
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = Orchestrator::builder(backend.clone())
        .state_store(store.clone())
        .spawn()
        .await;

    let started = Instant::now();
    orchestrator.submit("a tide pool").await.unwrap();
    assert!(orchestrator.submit("a tide pool").await.unwrap().cached);
    orchestrator.submit("a fern").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));

    // the writer catches up with the newest snapshot
    tokio::time::sleep(Duration::from_secs(180)).await;
    let saved = store.inner.current();
    assert!(saved.cache.contains_key("a fern"));
    assert_eq!(saved.recent_prompts, vec!["a fern", "a tide pool"]);
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<ImageRecord>>,
    fail: bool,
}

#[async_trait]
impl ImageSink for RecordingSink {
    async fn record(&self, record: ImageRecord) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Status(500));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn successful_generation_is_handed_to_the_sink() {
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Orchestrator::builder(ScriptedBackend::new(vec![]))
        .sink(sink.clone())
        .spawn()
        .await;

    orchestrator.submit("a koi pond").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt, "a koi pond");
    assert_eq!(records[0].elapsed_ms, 250);
    assert!(!records[0].is_favorite);
}

#[tokio::test(start_paused = true)]
async fn sink_failure_does_not_fail_generation() {
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..Default::default()
    });
    let orchestrator = Orchestrator::builder(ScriptedBackend::new(vec![]))
        .sink(sink)
        .spawn()
        .await;

    assert!(orchestrator.submit("a desert").await.is_ok());
}
