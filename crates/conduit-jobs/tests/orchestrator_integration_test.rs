//! End-to-end tests for the orchestrator: intake through the worker pool to
//! results and dead letters, using scripted in-process capabilities.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use conduit_jobs::{
    BatchConfig, BreakerConfig, Capability, CircuitState, DeadLetterEntry, DeadLetterFilter,
    DeadLetterReason, Error, FailureKind, InvokeError, InvokeResult, Job, JobDefaults, JobKind,
    JobOrchestrator, JobOutcome, JobStatus, JobStore, MemoryJobStore, OrchestratorConfig,
    Priority, QuotaConfig, QuotaRejectReason, QuotaUsage, ResultLookup, RetryPolicy,
    SubmitRequest, WorkerConfig, WorkerEvent,
};

// =============================================================================
// SCRIPTED CAPABILITY
// =============================================================================

/// Capability that replays a script of outcomes, then succeeds.
struct Scripted {
    name: String,
    script: Mutex<VecDeque<InvokeResult>>,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<JsonValue>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl Scripted {
    fn new(name: &str) -> Arc<Self> {
        Self::with_script(name, Vec::new(), Duration::ZERO)
    }

    fn with_script(name: &str, script: Vec<InvokeResult>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, payload: &JsonValue) -> InvokeResult {
        self.seen.lock().unwrap().push(payload.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "echo": payload })))
    }
}

#[async_trait]
impl Capability for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _kind: JobKind, payload: &JsonValue, _timeout: Duration) -> InvokeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.next_outcome(payload)
    }

    async fn invoke_batch(
        &self,
        _kind: JobKind,
        payloads: &[JsonValue],
        _timeout: Duration,
    ) -> Vec<InvokeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(payloads.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        payloads.iter().map(|p| self.next_outcome(p)).collect()
    }
}

/// Records the peak number of concurrent calls per tenant and the order in
/// which calls finish. Payloads carry `{"tenant": .., "id": ..}`.
struct TenantGauge {
    delay: Duration,
    active: Mutex<HashMap<String, usize>>,
    peak: Mutex<HashMap<String, usize>>,
    finished: Mutex<Vec<String>>,
}

impl TenantGauge {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            active: Mutex::new(HashMap::new()),
            peak: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
        })
    }

    fn peak(&self, tenant: &str) -> usize {
        self.peak.lock().unwrap().get(tenant).copied().unwrap_or(0)
    }

    fn finished_before(&self, first: &str, second: &str) -> bool {
        let finished = self.finished.lock().unwrap();
        let position = |id: &str| finished.iter().position(|f| f == id);
        matches!((position(first), position(second)), (Some(a), Some(b)) if a < b)
    }
}

#[async_trait]
impl Capability for TenantGauge {
    fn name(&self) -> &str {
        "llm"
    }

    async fn invoke(&self, _kind: JobKind, payload: &JsonValue, _timeout: Duration) -> InvokeResult {
        let tenant = payload["tenant"].as_str().unwrap_or_default().to_string();
        {
            let mut active = self.active.lock().unwrap();
            let now = active.entry(tenant.clone()).or_insert(0);
            *now += 1;
            let mut peak = self.peak.lock().unwrap();
            let high = peak.entry(tenant.clone()).or_insert(0);
            *high = (*high).max(*now);
        }
        tokio::time::sleep(self.delay).await;
        *self.active.lock().unwrap().entry(tenant).or_insert(1) -= 1;
        let id = payload["id"].as_str().unwrap_or_default().to_string();
        self.finished.lock().unwrap().push(id);
        Ok(json!({}))
    }
}

/// Memory store whose idempotency lookup yields after reading, so two
/// submissions can both miss the key before either registers its job.
#[derive(Default)]
struct YieldingStore(MemoryJobStore);

#[async_trait]
impl JobStore for YieldingStore {
    async fn save_job(&self, job: &Job) -> conduit_jobs::Result<()> {
        self.0.save_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> conduit_jobs::Result<Option<Job>> {
        self.0.get_job(job_id).await
    }

    async fn delete_job(&self, job_id: Uuid) -> conduit_jobs::Result<bool> {
        self.0.delete_job(job_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> conduit_jobs::Result<Option<Job>> {
        let found = self.0.find_by_idempotency_key(tenant_id, key).await;
        tokio::task::yield_now().await;
        found
    }

    async fn load_recoverable(&self) -> conduit_jobs::Result<Vec<Job>> {
        self.0.load_recoverable().await
    }

    async fn save_result(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
        expires_at: DateTime<Utc>,
    ) -> conduit_jobs::Result<()> {
        self.0.save_result(job_id, outcome, expires_at).await
    }

    async fn get_result(&self, job_id: Uuid) -> conduit_jobs::Result<Option<JobOutcome>> {
        self.0.get_result(job_id).await
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> conduit_jobs::Result<()> {
        self.0.save_dead_letter(entry).await
    }

    async fn remove_dead_letter(
        &self,
        job_id: Uuid,
    ) -> conduit_jobs::Result<Option<DeadLetterEntry>> {
        self.0.remove_dead_letter(job_id).await
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> conduit_jobs::Result<Vec<DeadLetterEntry>> {
        self.0.list_dead_letters(filter).await
    }

    async fn save_quota_usage(&self, usage: &QuotaUsage) -> conduit_jobs::Result<()> {
        self.0.save_quota_usage(usage).await
    }

    async fn load_quota_usage(
        &self,
        window_start: DateTime<Utc>,
    ) -> conduit_jobs::Result<Vec<QuotaUsage>> {
        self.0.load_quota_usage(window_start).await
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> conduit_jobs::Result<u64> {
        self.0.purge_terminal_before(cutoff).await
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn base_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_worker(
            WorkerConfig::default()
                .with_worker_count(2)
                .with_poll_interval(10)
                .with_shutdown_grace(500),
        )
        .with_batch(BatchConfig::disabled())
        .with_retry(
            RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .with_breaker(BreakerConfig::default().with_failure_threshold(100))
}

fn orchestrator(config: OrchestratorConfig, capability: Arc<Scripted>) -> JobOrchestrator {
    JobOrchestrator::builder()
        .with_config(config)
        .with_shared_capability(capability)
        .build()
}

fn request(payload: JsonValue) -> SubmitRequest {
    SubmitRequest::new("tenant-a", JobKind::Inference, "llm", payload)
}

async fn wait_for_batched(orch: &JobOrchestrator, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.stats().batched_jobs != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "batcher never held {} jobs",
            expected
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_status(orch: &JobOrchestrator, job_id: Uuid, expected: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = orch.get_status(job_id).await.unwrap();
        if status == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            job_id,
            status,
            expected
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// INTAKE
// =============================================================================

#[tokio::test]
async fn test_job_completes_and_result_is_pollable() {
    let llm = Scripted::new("llm");
    let orch = orchestrator(base_config(), llm.clone());
    let handle = orch.start();

    let job = orch.submit(request(json!({"prompt": "hi"}))).await.unwrap();
    wait_for_status(&orch, job.job_id, JobStatus::Completed).await;

    match orch.get_result(job.job_id).await.unwrap() {
        ResultLookup::Ready {
            outcome: JobOutcome::Completed { result },
        } => assert_eq!(result, json!({"echo": {"prompt": "hi"}})),
        other => panic!("unexpected result {:?}", other),
    }
    let stored = orch.get_job(job.job_id).await.unwrap();
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(llm.calls(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idempotent_resubmission_returns_existing_job() {
    let orch = orchestrator(base_config(), Scripted::new("llm"));

    let first = orch
        .submit(request(json!({})).with_idempotency_key("req-1"))
        .await
        .unwrap();
    let second = orch
        .submit(request(json!({})).with_idempotency_key("req-1"))
        .await
        .unwrap();

    assert_eq!(first.job_id, second.job_id);
    assert_eq!(orch.stats().queue_size, 1);
    assert_eq!(orch.quota_snapshot("tenant-a").await.daily_used, 1);
}

#[tokio::test]
async fn test_idempotency_key_is_shared_through_the_store() {
    let store = Arc::new(MemoryJobStore::new());
    let build = || {
        JobOrchestrator::builder()
            .with_config(base_config())
            .with_shared_capability(Scripted::new("llm"))
            .with_store(store.clone())
            .build()
    };
    let a = build();
    let b = build();

    let first = a
        .submit(request(json!({})).with_idempotency_key("k"))
        .await
        .unwrap();
    assert!(a.cancel(first.job_id).await.unwrap());
    let second = a
        .submit(request(json!({})).with_idempotency_key("k"))
        .await
        .unwrap();
    assert_ne!(second.job_id, first.job_id);

    // `b` has never seen the key; only the store knows the live job.
    let third = b
        .submit(request(json!({})).with_idempotency_key("k"))
        .await
        .unwrap();
    assert_eq!(third.job_id, second.job_id);
    assert_eq!(store.job_count(), 2);
}

#[tokio::test]
async fn test_concurrent_duplicate_submissions_admit_once() {
    let store = Arc::new(YieldingStore::default());
    let orch = JobOrchestrator::builder()
        .with_config(base_config())
        .with_shared_capability(Scripted::new("llm"))
        .with_store(store.clone())
        .build();

    let (a, b) = tokio::join!(
        orch.submit(request(json!("a")).with_idempotency_key("same")),
        orch.submit(request(json!("b")).with_idempotency_key("same"))
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.job_id, b.job_id);
    assert_eq!(orch.stats().queue_size, 1);
    // The losing submission's admission was refunded.
    assert_eq!(orch.quota_snapshot("tenant-a").await.daily_used, 1);
    assert_eq!(store.0.job_count(), 1);
}

#[tokio::test]
async fn test_rate_limit_rejects_eleventh_submission() {
    let config = base_config().with_quota(QuotaConfig::default().with_default_limits(1000, 10));
    let orch = orchestrator(config, Scripted::new("llm"));

    for i in 0..10 {
        orch.submit(request(json!({ "n": i }))).await.unwrap();
    }
    match orch.submit(request(json!({ "n": 10 }))).await {
        Err(Error::QuotaExceeded(rejection)) => {
            assert_eq!(rejection.reason, QuotaRejectReason::RateLimitExceeded);
            assert!(rejection.retry_after.is_some());
        }
        other => panic!("expected rate limit rejection, got {:?}", other),
    }
    // The rejection leaves no job behind.
    assert_eq!(orch.stats().queue_size, 10);
}

#[tokio::test]
async fn test_higher_priority_dispatches_first() {
    let llm = Scripted::new("llm");
    let config = base_config().with_worker(
        WorkerConfig::default()
            .with_worker_count(1)
            .with_max_inflight(1)
            .with_poll_interval(10),
    );
    let orch = orchestrator(config, llm.clone());

    let low = orch
        .submit(request(json!("low")).with_priority(Priority::Low))
        .await
        .unwrap();
    orch.submit(request(json!("normal"))).await.unwrap();
    orch.submit(request(json!("high")).with_priority(Priority::High))
        .await
        .unwrap();

    let handle = orch.start();
    wait_for_status(&orch, low.job_id, JobStatus::Completed).await;
    assert_eq!(
        *llm.seen.lock().unwrap(),
        vec![json!("high"), json!("normal"), json!("low")]
    );
    handle.shutdown().await.unwrap();
}

// =============================================================================
// FAILURES
// =============================================================================

#[tokio::test]
async fn test_retries_exhaust_into_single_dead_letter_then_requeue() {
    let llm = Scripted::with_script(
        "llm",
        vec![
            Err(InvokeError::new(FailureKind::ServerError, "503")),
            Err(InvokeError::new(FailureKind::ServerError, "503")),
            Err(InvokeError::new(FailureKind::ServerError, "503")),
        ],
        Duration::ZERO,
    );
    let orch = orchestrator(base_config(), llm.clone());
    let handle = orch.start();

    let job = orch
        .submit(request(json!({})).with_max_attempts(3))
        .await
        .unwrap();
    wait_for_status(&orch, job.job_id, JobStatus::DeadLetter).await;

    assert_eq!(llm.calls(), 3);
    let dead = orch.list_dead_letters(&DeadLetterFilter::default());
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(dead[0].job.attempt_count, 3);
    assert_eq!(dead[0].failure_kind, Some(FailureKind::ServerError));

    // Replay gets a fresh identity and attempt budget; the script is spent so it succeeds.
    let replayed = orch.requeue_dead_letter(job.job_id).await.unwrap();
    assert_ne!(replayed.job_id, job.job_id);
    wait_for_status(&orch, replayed.job_id, JobStatus::Completed).await;

    let replay = orch.get_job(replayed.job_id).await.unwrap();
    assert_eq!(replay.requeued_from, Some(job.job_id));
    assert_eq!(replay.attempt_count, 1);
    assert!(orch.list_dead_letters(&DeadLetterFilter::default()).is_empty());
    assert!(matches!(
        orch.requeue_dead_letter(job.job_id).await,
        Err(Error::NotFound(_))
    ));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_requeued_dead_letter_starts_fresh() {
    let store = Arc::new(MemoryJobStore::new());
    let mut job = Job::from_request(
        request(json!({"n": 1})).with_max_attempts(1),
        &JobDefaults::default(),
    );
    job.transition(JobStatus::Queued).unwrap();
    job.begin_attempt().unwrap();
    job.transition(JobStatus::Failed).unwrap();
    job.transition(JobStatus::DeadLetter).unwrap();
    store
        .save_dead_letter(&DeadLetterEntry {
            job: job.clone(),
            reason: DeadLetterReason::RetriesExhausted,
            failure_kind: Some(FailureKind::ServerError),
            last_error: Some("503".to_string()),
            dead_lettered_at: Utc::now(),
        })
        .await
        .unwrap();

    let orch = JobOrchestrator::builder()
        .with_config(base_config())
        .with_shared_capability(Scripted::new("llm"))
        .with_store(store.clone())
        .build();
    assert_eq!(orch.restore().await.unwrap().dead_letters, 1);

    let replayed = orch.requeue_dead_letter(job.job_id).await.unwrap();
    assert_eq!(replayed.status, JobStatus::Queued);
    let queued = orch.get_job(replayed.job_id).await.unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.attempt_count, 0);
    assert_eq!(queued.max_attempts, 1);
    assert_eq!(queued.requeued_from, Some(job.job_id));
    assert_eq!(
        store.get_job(replayed.job_id).await.unwrap().map(|j| j.status),
        Some(JobStatus::Queued)
    );
    assert!(store
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap()
        .is_empty());

    let handle = orch.start();
    wait_for_status(&orch, replayed.job_id, JobStatus::Completed).await;
    assert_eq!(orch.get_job(replayed.job_id).await.unwrap().attempt_count, 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let llm = Scripted::with_script(
        "llm",
        vec![Err(InvokeError::new(FailureKind::MalformedInput, "bad prompt"))],
        Duration::ZERO,
    );
    let orch = orchestrator(base_config(), llm.clone());
    let handle = orch.start();

    let job = orch.submit(request(json!({}))).await.unwrap();
    wait_for_status(&orch, job.job_id, JobStatus::DeadLetter).await;

    assert_eq!(llm.calls(), 1);
    let entry = orch.dead_letter(job.job_id).unwrap();
    assert_eq!(entry.reason, DeadLetterReason::NonRetryable);
    match orch.get_result(job.job_id).await.unwrap() {
        ResultLookup::Ready {
            outcome: JobOutcome::Failed { kind, attempts, .. },
        } => {
            assert_eq!(kind, Some(FailureKind::MalformedInput));
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected result {:?}", other),
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_breaker_opens_and_short_circuits_calls() {
    let llm = Scripted::with_script(
        "llm",
        vec![
            Err(InvokeError::new(FailureKind::Connection, "refused")),
            Err(InvokeError::new(FailureKind::Connection, "refused")),
        ],
        Duration::ZERO,
    );
    let config = base_config().with_breaker(
        BreakerConfig::default()
            .with_failure_threshold(2)
            .with_open_timeout(Duration::from_secs(60)),
    );
    let orch = orchestrator(config, llm.clone());
    let mut events = orch.events();
    let handle = orch.start();

    for _ in 0..2 {
        let job = orch
            .submit(request(json!({})).with_max_attempts(1))
            .await
            .unwrap();
        wait_for_status(&orch, job.job_id, JobStatus::DeadLetter).await;
    }
    assert_eq!(orch.breaker_snapshot("llm").state, CircuitState::Open);

    let blocked = orch
        .submit(request(json!({})).with_max_attempts(1))
        .await
        .unwrap();
    wait_for_status(&orch, blocked.job_id, JobStatus::DeadLetter).await;
    // Short-circuited without touching the dependency.
    assert_eq!(llm.calls(), 2);
    assert_eq!(
        orch.dead_letter(blocked.job_id).unwrap().failure_kind,
        Some(FailureKind::CircuitOpen)
    );

    let mut opened = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerEvent::BreakerOpened { ref dependency } if dependency == "llm") {
            opened = true;
        }
    }
    assert!(opened);

    orch.reset_breaker("llm");
    assert_eq!(orch.breaker_snapshot("llm").state, CircuitState::Closed);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open_probe() {
    let llm = Scripted::with_script(
        "llm",
        vec![Err(InvokeError::new(FailureKind::Connection, "refused"))],
        Duration::ZERO,
    );
    let config = base_config().with_breaker(
        BreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(1)
            .with_half_open_max_calls(1)
            .with_open_timeout(Duration::from_millis(100)),
    );
    let orch = orchestrator(config, llm.clone());
    let handle = orch.start();

    let tripped = orch
        .submit(request(json!({})).with_max_attempts(1))
        .await
        .unwrap();
    wait_for_status(&orch, tripped.job_id, JobStatus::DeadLetter).await;
    assert_eq!(orch.breaker_snapshot("llm").state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let probe = orch
        .submit(request(json!({})).with_max_attempts(1))
        .await
        .unwrap();
    wait_for_status(&orch, probe.job_id, JobStatus::Completed).await;

    let snapshot = orch.breaker_snapshot("llm");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.probes_in_flight, 0);
    assert_eq!(llm.calls(), 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_attempt_exceeding_budget_times_out() {
    let llm = Scripted::with_script("llm", Vec::new(), Duration::from_secs(2));
    let orch = orchestrator(base_config(), llm);
    let handle = orch.start();

    let job = orch
        .submit(
            request(json!({}))
                .with_timeout(Duration::from_millis(100))
                .with_max_attempts(3),
        )
        .await
        .unwrap();
    wait_for_status(&orch, job.job_id, JobStatus::TimedOut).await;

    assert_eq!(
        orch.get_result(job.job_id).await.unwrap(),
        ResultLookup::Ready {
            outcome: JobOutcome::TimedOut { attempts: 1 }
        }
    );
    let timed_out = orch.get_job(job.job_id).await.unwrap();
    assert!(timed_out.attempt_count <= timed_out.max_attempts);
    handle.shutdown().await.unwrap();
}

// =============================================================================
// FAIRNESS
// =============================================================================

#[tokio::test]
async fn test_tenant_inflight_cap_leaves_room_for_other_tenants() {
    let gauge = TenantGauge::new(Duration::from_millis(150));
    let config = base_config().with_worker(
        WorkerConfig::default()
            .with_worker_count(2)
            .with_max_inflight(2)
            .with_tenant_max_inflight(1)
            .with_poll_interval(10),
    );
    let orch = JobOrchestrator::builder()
        .with_config(config)
        .with_shared_capability(gauge.clone())
        .build();

    let mut jobs = Vec::new();
    for id in ["a1", "a2", "a3"] {
        let payload = json!({"tenant": "tenant-a", "id": id});
        jobs.push(orch.submit(request(payload)).await.unwrap().job_id);
    }
    let payload = json!({"tenant": "tenant-b", "id": "b1"});
    let late = SubmitRequest::new("tenant-b", JobKind::Inference, "llm", payload);
    jobs.push(orch.submit(late).await.unwrap().job_id);

    let handle = orch.start();
    for job_id in &jobs {
        wait_for_status(&orch, *job_id, JobStatus::Completed).await;
    }

    assert_eq!(gauge.peak("tenant-a"), 1);
    assert_eq!(gauge.peak("tenant-b"), 1);
    // tenant-b was admitted last but ran alongside tenant-a's first job.
    assert!(gauge.finished_before("b1", "a2"));
    handle.shutdown().await.unwrap();
}

// =============================================================================
// BATCHING
// =============================================================================

#[tokio::test]
async fn test_batch_results_decompose_per_job() {
    let llm = Scripted::with_script(
        "llm",
        vec![
            Ok(json!("first")),
            Err(InvokeError::new(FailureKind::MalformedInput, "bad item")),
            Ok(json!("third")),
        ],
        Duration::ZERO,
    );
    let config = base_config().with_batch(
        BatchConfig::default()
            .with_max_size(3)
            .with_window(Duration::from_millis(200)),
    );
    let orch = orchestrator(config, llm.clone());

    let mut ids = Vec::new();
    for i in 0..3 {
        let job = orch
            .submit(request(json!({ "n": i })).with_max_attempts(1))
            .await
            .unwrap();
        ids.push(job.job_id);
    }
    let handle = orch.start();

    wait_for_status(&orch, ids[0], JobStatus::Completed).await;
    wait_for_status(&orch, ids[1], JobStatus::DeadLetter).await;
    wait_for_status(&orch, ids[2], JobStatus::Completed).await;

    assert_eq!(*llm.batch_sizes.lock().unwrap(), vec![3]);
    assert_eq!(
        orch.get_result(ids[2]).await.unwrap(),
        ResultLookup::Ready {
            outcome: JobOutcome::Completed {
                result: json!("third")
            }
        }
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_batch_flushes_after_window() {
    let llm = Scripted::new("llm");
    let config = base_config().with_batch(
        BatchConfig::default()
            .with_max_size(10)
            .with_window(Duration::from_millis(30)),
    );
    let orch = orchestrator(config, llm.clone());
    let handle = orch.start();

    let job = orch.submit(request(json!({}))).await.unwrap();
    wait_for_status(&orch, job.job_id, JobStatus::Completed).await;
    assert_eq!(llm.calls(), 1);
    handle.shutdown().await.unwrap();
}

// =============================================================================
// CANCELLATION AND LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_cancel_running_job() {
    let llm = Scripted::with_script("llm", Vec::new(), Duration::from_secs(5));
    let orch = orchestrator(base_config(), llm);
    let handle = orch.start();

    let job = orch.submit(request(json!({}))).await.unwrap();
    wait_for_status(&orch, job.job_id, JobStatus::Running).await;

    assert!(orch.cancel(job.job_id).await.unwrap());
    wait_for_status(&orch, job.job_id, JobStatus::Cancelled).await;

    assert_eq!(
        orch.get_result(job.job_id).await.unwrap(),
        ResultLookup::Ready {
            outcome: JobOutcome::Cancelled
        }
    );
    assert_eq!(
        orch.dead_letter(job.job_id).unwrap().reason,
        DeadLetterReason::CancelledInFlight
    );
    // An aborted call says nothing about dependency health.
    assert_eq!(orch.breaker_snapshot("llm").failure_count, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_persists_queue_for_restore() {
    let store = Arc::new(MemoryJobStore::new());
    let paused = base_config().with_worker(WorkerConfig::default().with_enabled(false));
    let first = JobOrchestrator::builder()
        .with_config(paused)
        .with_shared_capability(Scripted::new("llm"))
        .with_store(store.clone())
        .build();

    let a = first.submit(request(json!("a"))).await.unwrap();
    let b = first.submit(request(json!("b"))).await.unwrap();
    let handle = first.start();
    handle.shutdown().await.unwrap();

    assert!(matches!(
        first.submit(request(json!("c"))).await,
        Err(Error::ShuttingDown)
    ));
    let persisted = store.get_job(a.job_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Queued);

    let second = JobOrchestrator::builder()
        .with_config(base_config())
        .with_shared_capability(Scripted::new("llm"))
        .with_store(store)
        .build();
    let report = second.restore().await.unwrap();
    assert_eq!(report.jobs, 2);
    assert_eq!(report.quota_tenants, 1);
    assert_eq!(second.quota_snapshot("tenant-a").await.daily_used, 2);

    let handle = second.start();
    wait_for_status(&second, a.job_id, JobStatus::Completed).await;
    wait_for_status(&second, b.job_id, JobStatus::Completed).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_open_batch_without_waiting_for_window() {
    let llm = Scripted::new("llm");
    let config = base_config().with_batch(
        BatchConfig::default()
            .with_max_size(10)
            .with_window(Duration::from_secs(10)),
    );
    let orch = orchestrator(config, llm.clone());
    let handle = orch.start();

    let a = orch.submit(request(json!("a"))).await.unwrap();
    let b = orch.submit(request(json!("b"))).await.unwrap();
    wait_for_batched(&orch, 2).await;
    assert_eq!(llm.calls(), 0);

    let started = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(*llm.batch_sizes.lock().unwrap(), vec![2]);
    assert_eq!(orch.get_status(a.job_id).await.unwrap(), JobStatus::Completed);
    assert_eq!(orch.get_status(b.job_id).await.unwrap(), JobStatus::Completed);
}

#[tokio::test]
async fn test_shutdown_drains_within_one_grace_period() {
    let llm = Scripted::with_script("llm", Vec::new(), Duration::from_secs(5));
    let config = base_config()
        .with_worker(
            WorkerConfig::default()
                .with_worker_count(2)
                .with_poll_interval(10)
                .with_shutdown_grace(300),
        )
        .with_batch(
            BatchConfig::default()
                .with_max_size(2)
                .with_window(Duration::from_secs(10)),
        );
    let orch = orchestrator(config, llm);
    let handle = orch.start();

    // A full batch goes straight to a worker and hangs there.
    let running = orch.submit(request(json!(1))).await.unwrap();
    orch.submit(request(json!(2))).await.unwrap();
    wait_for_status(&orch, running.job_id, JobStatus::Running).await;

    // A partial batch stays open until shutdown flushes it, then hangs too.
    let open = orch
        .submit(SubmitRequest::new("tenant-a", JobKind::Embedding, "llm", json!(3)))
        .await
        .unwrap();
    wait_for_batched(&orch, 1).await;

    let started = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    let took = started.elapsed();
    assert!(took < Duration::from_millis(550), "shutdown took {:?}", took);

    // Abandoned attempts go back to the queue uncounted.
    for job_id in [running.job_id, open.job_id] {
        let job = orch.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
    }
}
