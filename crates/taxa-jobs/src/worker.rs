//! Queue worker for taxon jobs.
//!
//! Claims jobs of the registered types, runs each under a timeout and
//! records the outcome on the job row. Concurrency is bounded by a
//! semaphore; shutdown stops claiming and waits for running jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use taxa_core::defaults::{JOB_MAX_CONCURRENT, JOB_POLL_INTERVAL_MS, JOB_TIMEOUT_SECS};
use taxa_core::{Error, Job, JobRepository, JobStatus, JobType, Result};

use crate::handler::{JobContext, JobHandler, JobResult};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Sleep between claims while the queue is empty.
    pub poll_interval: Duration,
    /// A job still running after this is failed as transient.
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_jobs: JOB_MAX_CONCURRENT,
            poll_interval: Duration::from_millis(JOB_POLL_INTERVAL_MS),
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | `false` or `0` disables claiming |
    /// | `JOB_MAX_CONCURRENT` | `4` | Concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `2000` | Idle poll interval |
    /// | `JOB_TIMEOUT_SECS` | `3600` | Per-job timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("JOB_WORKER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.enabled),
            max_concurrent_jobs: env_parse::<usize>("JOB_MAX_CONCURRENT")
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            poll_interval: env_parse("JOB_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            job_timeout: env_parse::<u64>("JOB_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, limit: Duration) -> Self {
        self.job_timeout = limit;
        self
    }
}

/// How one claimed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed {
        job_id: Uuid,
        job_type: JobType,
    },
    Failed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
        /// Whether the row went back to `pending`.
        requeued: bool,
    },
}

/// Dispatches claimed jobs to their handlers.
#[derive(Clone)]
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    handlers: Arc<HashMap<JobType, Arc<dyn JobHandler>>>,
    config: WorkerConfig,
    wake: Arc<Notify>,
}

impl JobWorker {
    pub fn new(jobs: Arc<dyn JobRepository>, config: WorkerConfig) -> Self {
        Self {
            jobs,
            handlers: Arc::new(HashMap::new()),
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Register the handler for its job type, replacing any earlier one.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        Arc::make_mut(&mut self.handlers).insert(handler.job_type(), Arc::new(handler));
        self
    }

    /// Cut idle sleeps short when `notify` fires, typically
    /// `PgJobRepository::job_notify`.
    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = notify;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Job types this worker claims.
    pub fn job_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.jobs.pending_count().await
    }

    /// Claim one job and run it to the end. `None` when nothing is queued
    /// for the registered types.
    pub async fn run_next(&self) -> Result<Option<Dispatch>> {
        let Some(job) = self.jobs.claim(&self.job_types()).await? else {
            return Ok(None);
        };
        Ok(Some(self.dispatch(job).await))
    }

    async fn dispatch(&self, job: Job) -> Dispatch {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type;
        debug!(subsystem = "jobs", component = "worker", %job_id, %job_type, retry_count = job.retry_count, "Dispatching job");

        let result = match self.handlers.get(&job_type) {
            Some(handler) => {
                match timeout(self.config.job_timeout, handler.execute(JobContext::new(job))).await {
                    Ok(result) => result,
                    Err(_) => JobResult::Retry(format!(
                        "timed out after {}s",
                        self.config.job_timeout.as_secs_f64()
                    )),
                }
            }
            None => JobResult::Failed(format!("no handler registered for {job_type}")),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result.into_outcome() {
            Ok(value) => {
                if let Err(e) = self.jobs.complete(job_id, value).await {
                    error!(subsystem = "jobs", %job_id, error = %e, "Recording job result failed");
                }
                info!(subsystem = "jobs", component = "worker", %job_id, %job_type, duration_ms, "Job completed");
                Dispatch::Completed { job_id, job_type }
            }
            Err((error, kind)) => {
                let requeued = match self.jobs.fail(job_id, &error, kind).await {
                    Ok(status) => status == JobStatus::Pending,
                    Err(e) => {
                        error!(subsystem = "jobs", %job_id, error = %e, "Recording job failure failed");
                        false
                    }
                };
                warn!(subsystem = "jobs", component = "worker", %job_id, %job_type, ?kind, requeued, %error, duration_ms, "Job failed");
                Dispatch::Failed {
                    job_id,
                    job_type,
                    error,
                    requeued,
                }
            }
        }
    }

    /// Run on a background task until the handle shuts it down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, stop) = watch::channel(false);
        let task = tokio::spawn(self.run(stop));
        WorkerHandle { shutdown, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Job worker disabled");
            return;
        }
        let job_types = self.job_types();
        info!(
            subsystem = "jobs",
            component = "worker",
            max_concurrent = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            handlers = job_types.len(),
            "Job worker started"
        );

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut running = JoinSet::new();

        loop {
            // A dropped handle stops the worker too.
            if *stop.borrow() || stop.has_changed().is_err() {
                break;
            }
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = stop.changed() => continue,
            };
            while let Some(finished) = running.try_join_next() {
                if let Err(e) = finished {
                    error!(subsystem = "jobs", error = %e, "Job task panicked");
                }
            }

            match self.jobs.claim(&job_types).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        worker.dispatch(job).await
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut stop).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!(subsystem = "jobs", error = %e, "Claiming a job failed");
                    self.idle(&mut stop).await;
                }
            }
        }

        if !running.is_empty() {
            info!(subsystem = "jobs", running = running.len(), "Waiting for running jobs");
        }
        while let Some(finished) = running.join_next().await {
            if let Err(e) = finished {
                error!(subsystem = "jobs", error = %e, "Job task panicked");
            }
        }
        info!(subsystem = "jobs", component = "worker", "Job worker stopped");
    }

    async fn idle(&self, stop: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(self.config.poll_interval) => {}
            _ = self.wake.notified() => debug!("Woken by queued job"),
            _ = stop.changed() => {}
        }
    }
}

/// Control over a spawned worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop claiming and wait for running jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        // Err only when the worker already exited.
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Job(format!("worker task ended abnormally: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};
    use taxa_core::FailureKind;

    use crate::handler::tests::job;

    /// Job rows held in memory, with the same retry rules as the table.
    #[derive(Default)]
    struct MemoryQueue {
        jobs: Mutex<Vec<Job>>,
    }

    impl MemoryQueue {
        fn row(&self, job_id: Uuid) -> Job {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .find(|j| j.id == job_id)
                .cloned()
                .expect("job row")
        }
    }

    #[async_trait]
    impl JobRepository for MemoryQueue {
        async fn queue(
            &self,
            job_type: JobType,
            priority: i32,
            payload: Option<JsonValue>,
        ) -> Result<Uuid> {
            let mut row = job(job_type, payload);
            row.status = JobStatus::Pending;
            row.priority = priority;
            row.started_at = None;
            let id = row.id;
            self.jobs.lock().unwrap().push(row);
            Ok(id)
        }

        async fn claim(&self, job_types: &[JobType]) -> Result<Option<Job>> {
            let mut jobs = self.jobs.lock().unwrap();
            let next = jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Pending && job_types.contains(&j.job_type))
                .min_by_key(|j| (Reverse(j.priority), j.created_at));
            Ok(next.map(|j| {
                j.status = JobStatus::Running;
                j.clone()
            }))
        }

        async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(j) = jobs.iter_mut().find(|j| j.id == job_id) {
                if j.status != JobStatus::Cancelled {
                    j.status = JobStatus::Completed;
                }
                j.result = result;
            }
            Ok(())
        }

        async fn fail(&self, job_id: Uuid, error: &str, kind: FailureKind) -> Result<JobStatus> {
            let mut jobs = self.jobs.lock().unwrap();
            let j = jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
            j.error_message = Some(error.to_string());
            if j.status != JobStatus::Cancelled {
                if kind.is_retryable() && j.has_retries_left() {
                    j.retry_count += 1;
                    j.status = JobStatus::Pending;
                } else {
                    j.status = JobStatus::Failed;
                }
            }
            Ok(j.status)
        }

        async fn cancel(&self, job_id: Uuid) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            Ok(match jobs.iter_mut().find(|j| j.id == job_id) {
                Some(j) if matches!(j.status, JobStatus::Pending | JobStatus::Running) => {
                    j.status = JobStatus::Cancelled;
                    true
                }
                _ => false,
            })
        }

        async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == job_id).cloned())
        }

        async fn pending_count(&self) -> Result<i64> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.status == JobStatus::Pending)
                .count() as i64)
        }
    }

    /// Merge stand-in: echoes the payload back as the result.
    struct EchoMerge;

    #[async_trait]
    impl JobHandler for EchoMerge {
        fn job_type(&self) -> JobType {
            JobType::MergeDuplicates
        }

        async fn execute(&self, ctx: JobContext) -> JobResult {
            JobResult::Success(ctx.job.payload.clone())
        }
    }

    /// Resync stand-in that always reports the given result.
    struct FixedResync(fn() -> JobResult);

    #[async_trait]
    impl JobHandler for FixedResync {
        fn job_type(&self) -> JobType {
            JobType::ResyncParent
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            (self.0)()
        }
    }

    /// Harvest stand-in that takes `delay` and tracks how many run at once.
    struct SlowHarvest {
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SlowHarvest {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl JobHandler for SlowHarvest {
        fn job_type(&self) -> JobType {
            JobType::HarvestOccurrences
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            JobResult::Success(Some(json!({ "status": { "status": "completed" } })))
        }
    }

    fn worker(queue: &Arc<MemoryQueue>) -> JobWorker {
        JobWorker::new(
            queue.clone(),
            WorkerConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
    }

    async fn wait_for_status(queue: &MemoryQueue, job_id: Uuid, status: JobStatus) {
        timeout(Duration::from_secs(5), async {
            while queue.row(job_id).status != status {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job never reached {:?}", status));
    }

    #[test]
    fn test_config_builder_clamps_concurrency() {
        let config = WorkerConfig::default()
            .with_max_concurrent(0)
            .with_enabled(false)
            .with_job_timeout(Duration::from_secs(5));

        assert_eq!(config.max_concurrent_jobs, 1);
        assert!(!config.enabled);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert_eq!(
            WorkerConfig::default().poll_interval,
            Duration::from_millis(JOB_POLL_INTERVAL_MS)
        );
    }

    #[tokio::test]
    async fn test_run_next_completes_job_with_result() {
        let queue = Arc::new(MemoryQueue::default());
        let payload = json!({ "name": "Panthera", "rank": "GENUS" });
        let job_id = queue
            .queue(JobType::MergeDuplicates, 5, Some(payload.clone()))
            .await
            .unwrap();
        let worker = worker(&queue).with_handler(EchoMerge);

        let dispatch = worker.run_next().await.unwrap();

        assert_eq!(
            dispatch,
            Some(Dispatch::Completed {
                job_id,
                job_type: JobType::MergeDuplicates
            })
        );
        let row = queue.row(job_id);
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.result, Some(payload));
        assert_eq!(worker.run_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_retry_requeues_and_failure_does_not() {
        let queue = Arc::new(MemoryQueue::default());
        let flaky = queue.queue(JobType::ResyncParent, 3, None).await.unwrap();
        let worker = worker(&queue)
            .with_handler(FixedResync(|| JobResult::Retry("registry unavailable".into())));

        let dispatch = worker.run_next().await.unwrap().unwrap();
        assert!(matches!(dispatch, Dispatch::Failed { requeued: true, .. }));
        assert_eq!(queue.row(flaky).status, JobStatus::Pending);
        assert_eq!(queue.row(flaky).retry_count, 1);

        let broken = Arc::new(MemoryQueue::default());
        let bad = broken.queue(JobType::ResyncParent, 3, None).await.unwrap();
        let worker = JobWorker::new(broken.clone(), WorkerConfig::default())
            .with_handler(FixedResync(|| JobResult::Failed("taxon 9 not found".into())));

        let dispatch = worker.run_next().await.unwrap().unwrap();
        assert!(matches!(dispatch, Dispatch::Failed { requeued: false, .. }));
        let row = broken.row(bad);
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.error_message.as_deref(), Some("taxon 9 not found"));
    }

    #[tokio::test]
    async fn test_timed_out_job_is_requeued() {
        let queue = Arc::new(MemoryQueue::default());
        let job_id = queue.queue(JobType::HarvestOccurrences, 2, None).await.unwrap();
        let worker = JobWorker::new(
            queue.clone(),
            WorkerConfig::default().with_job_timeout(Duration::from_millis(20)),
        )
        .with_handler(SlowHarvest::new(Duration::from_secs(30)));

        let dispatch = worker.run_next().await.unwrap().unwrap();

        let Dispatch::Failed { error, requeued, .. } = dispatch else {
            panic!("expected failure, got {:?}", dispatch);
        };
        assert!(error.contains("timed out"));
        assert!(requeued);
        assert_eq!(queue.row(job_id).retry_count, 1);
    }

    #[tokio::test]
    async fn test_unregistered_types_are_left_queued() {
        let queue = Arc::new(MemoryQueue::default());
        let resolve = queue.queue(JobType::ResolveTaxon, 6, None).await.unwrap();
        let merge = queue.queue(JobType::MergeDuplicates, 5, None).await.unwrap();
        let worker = worker(&queue).with_handler(EchoMerge);

        assert!(worker.run_next().await.unwrap().is_some());
        assert!(worker.run_next().await.unwrap().is_none());

        assert_eq!(queue.row(merge).status, JobStatus::Completed);
        assert_eq!(queue.row(resolve).status, JobStatus::Pending);
        assert_eq!(worker.job_types(), vec![JobType::MergeDuplicates]);
    }

    #[tokio::test]
    async fn test_spawned_worker_bounds_concurrency() {
        let queue = Arc::new(MemoryQueue::default());
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(queue.queue(JobType::HarvestOccurrences, 2, None).await.unwrap());
        }
        let harvest = SlowHarvest::new(Duration::from_millis(30));
        let peak = harvest.peak.clone();
        let handle = JobWorker::new(
            queue.clone(),
            WorkerConfig::default()
                .with_max_concurrent(2)
                .with_poll_interval(Duration::from_millis(10)),
        )
        .with_handler(harvest)
        .spawn();

        for id in &ids {
            wait_for_status(&queue, *id, JobStatus::Completed).await;
        }
        handle.shutdown().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_job() {
        let queue = Arc::new(MemoryQueue::default());
        let job_id = queue.queue(JobType::HarvestOccurrences, 2, None).await.unwrap();
        let handle = worker(&queue)
            .with_handler(SlowHarvest::new(Duration::from_millis(100)))
            .spawn();

        wait_for_status(&queue, job_id, JobStatus::Running).await;
        handle.shutdown().await.unwrap();

        assert_eq!(queue.row(job_id).status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_wake_cuts_idle_sleep_short() {
        let queue = Arc::new(MemoryQueue::default());
        let notify = Arc::new(Notify::new());
        let handle = JobWorker::new(
            queue.clone(),
            WorkerConfig::default().with_poll_interval(Duration::from_secs(60)),
        )
        .with_handler(EchoMerge)
        .with_wake(notify.clone())
        .spawn();

        sleep(Duration::from_millis(20)).await;
        let job_id = queue.queue(JobType::MergeDuplicates, 5, None).await.unwrap();
        notify.notify_one();

        wait_for_status(&queue, job_id, JobStatus::Completed).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_worker_claims_nothing() {
        let queue = Arc::new(MemoryQueue::default());
        let job_id = queue.queue(JobType::MergeDuplicates, 5, None).await.unwrap();
        let handle = JobWorker::new(queue.clone(), WorkerConfig::default().with_enabled(false))
            .with_handler(EchoMerge)
            .spawn();

        sleep(Duration::from_millis(50)).await;

        assert!(handle.is_finished());
        assert_eq!(queue.row(job_id).status, JobStatus::Pending);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        handle.shutdown().await.unwrap();
    }
}
