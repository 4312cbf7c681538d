// Job Scheduler
// Trigger gating, one task per job instance, scoped worker leases

use crate::config::EngineConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::aggregator::{outcome_channel, ResultAggregator};
use crate::execution::cancel::{cancel_channel, CancelHandle, CancelSignal};
use crate::execution::context::RuntimeContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::StepExecutor;
use crate::execution::matrix::{JobInstance, MatrixExpander};
use crate::execution::outcome::{JobOutcome, JobStatus, RunFailure, RunOutcome, RunStatus, StepOutcome, StepRecord};
use crate::runners::ActionRegistry;
use crate::spec::models::{RunSpec, Step};
use crate::spec::parser::RunSpecParser;
use crate::spec::trigger::TriggerEvent;
use crate::worker::{
    provision_with_retry, HostProvisioner, ProvisionRequest, Provisioner, RetryPolicy, WorkerPool,
};

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Starts runs of one RunSpec in response to trigger events
pub struct JobScheduler {
    spec: Arc<RunSpec>,
    config: EngineConfig,
    pool: Arc<WorkerPool>,
    provisioner: Arc<dyn Provisioner>,
    actions: Arc<ActionRegistry>,
    event_tx: Option<ProgressSender>,
}

impl JobScheduler {
    /// Create a scheduler with a worker pool sized from `config`
    pub fn new(spec: RunSpec, config: EngineConfig) -> Self {
        let pool = WorkerPool::new(
            config.max_parallel,
            config.working_dir.clone(),
            config.scratch_root.clone(),
        );
        Self {
            spec: Arc::new(spec),
            config,
            pool,
            provisioner: Arc::new(HostProvisioner::new()),
            actions: Arc::new(ActionRegistry::default()),
            event_tx: None,
        }
    }

    /// Share an existing pool (e.g. between schedulers of several specs)
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_provisioner(mut self, provisioner: impl Provisioner + 'static) -> Self {
        self.provisioner = Arc::new(provisioner);
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    /// Set progress event sender for real-time updates
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Start a run for `event`.
    ///
    /// Returns `Ok(None)` when the RunSpec does not declare a matching trigger.
    /// Configuration errors are returned before any worker is acquired. Must
    /// be called from within a Tokio runtime.
    pub fn dispatch(&self, event: TriggerEvent) -> ServiceResult<Option<RunHandle>> {
        if !self.spec.accepts(&event) {
            let reason = format!("'{}' does not declare this trigger", self.spec.name);
            tracing::info!(event = event.name(), event_type = ?event.event_type(), "{}", reason);
            self.event_tx.send_event(ExecutionEvent::TriggerIgnored {
                event_name: event.name().to_string(),
                reason,
            });
            return Ok(None);
        }

        RunSpecParser::validate(&self.spec, &self.actions)?;
        let instances = MatrixExpander::expand_all(&self.spec.name, &self.spec.axes)?;

        let run_id = Uuid::new_v4();
        let total_jobs = instances.len();
        let (cancel, signal) = cancel_channel();
        let (outcome_tx, outcome_rx) = outcome_channel();
        let event = Arc::new(event);

        tracing::info!(%run_id, run = %self.spec.name, jobs = total_jobs, "run started");
        self.event_tx.send_event(ExecutionEvent::run_started(
            run_id,
            &self.spec.name,
            total_jobs,
        ));

        let mut executor = StepExecutor::new(self.actions.clone())
            .with_step_timeout(self.config.default_step_timeout)
            .with_output_limit(self.config.output_limit);
        if let Some(tx) = &self.event_tx {
            executor = executor.with_progress(tx.clone());
        }

        let job = JobTask {
            run_id,
            spec: self.spec.clone(),
            event: event.clone(),
            pool: self.pool.clone(),
            provisioner: self.provisioner.clone(),
            executor: Arc::new(executor),
            retry: RetryPolicy::new(
                self.spec
                    .provision
                    .max_retries
                    .unwrap_or(self.config.provision_retries),
                self.config.provision_backoff,
            ),
            command_timeout: self.config.default_step_timeout,
            output_limit: self.config.output_limit,
            signal: signal.clone(),
            event_tx: self.event_tx.clone(),
        };

        for instance in instances.iter().cloned() {
            let job = job.clone();
            let outcome_tx = outcome_tx.clone();
            tokio::spawn(async move {
                let outcome = job.run(instance).await;
                let _ = outcome_tx.send(outcome);
            });
        }
        drop(outcome_tx);

        let aggregator =
            ResultAggregator::new(run_id, self.spec.name.clone(), (*event).clone(), instances);
        let run_timeout = self.config.run_timeout;
        let event_tx = self.event_tx.clone();
        let run_cancel = cancel.clone();
        let started = Instant::now();

        let join = tokio::spawn(async move {
            let mut outcome = aggregator.collect(outcome_rx, run_timeout).await;

            if outcome.failure.is_none() && run_cancel.is_cancelled() {
                outcome.failure = Some(RunFailure::Cancelled);
                outcome.status = RunStatus::Failure;
            }
            // stragglers past the deadline must give their workers back
            if matches!(outcome.failure, Some(RunFailure::Timeout { .. })) {
                run_cancel.cancel();
            }

            tracing::info!(
                %run_id,
                status = ?outcome.status,
                failed = outcome.failed_jobs().count(),
                "run completed"
            );
            event_tx.send_event(ExecutionEvent::run_completed(
                run_id,
                outcome.status,
                started.elapsed(),
            ));
            outcome
        });

        Ok(Some(RunHandle {
            run_id,
            total_jobs,
            cancel,
            join,
        }))
    }
}

/// Everything one job instance task needs, cloned per instance
#[derive(Clone)]
struct JobTask {
    run_id: Uuid,
    spec: Arc<RunSpec>,
    event: Arc<TriggerEvent>,
    pool: Arc<WorkerPool>,
    provisioner: Arc<dyn Provisioner>,
    executor: Arc<StepExecutor>,
    retry: RetryPolicy,
    command_timeout: Option<Duration>,
    output_limit: usize,
    signal: CancelSignal,
    event_tx: Option<ProgressSender>,
}

impl JobTask {
    /// Acquire a worker, provision, run steps, tear down, release. The lease
    /// is released on every path, including panics, through its `Drop`.
    async fn run(self, instance: JobInstance) -> JobOutcome {
        let mut signal = self.signal.clone();
        let mut lease = match self.pool.acquire(self.run_id, &mut signal).await {
            Ok(lease) => lease,
            Err(ServiceError::Cancelled) => {
                let mut outcome = JobOutcome::not_started(instance, JobStatus::Cancelled);
                outcome.steps = skipped_steps(&self.spec.steps, "run was cancelled");
                return outcome;
            }
            Err(e) => {
                tracing::error!(job = %instance.name, error = %e, "failed to acquire worker");
                let mut outcome = JobOutcome::not_started(instance, JobStatus::Failure);
                outcome.steps = skipped_steps(&self.spec.steps, &format!("no worker: {}", e));
                return outcome;
            }
        };

        let start = Instant::now();
        let started_at = Utc::now();
        let job_name = instance.name.clone();
        tracing::info!(run_id = %self.run_id, job = %job_name, worker_id = lease.id(), "job started");
        self.event_tx.send_event(ExecutionEvent::job_started(
            &job_name,
            instance.index,
            lease.id(),
            self.spec.steps.len(),
        ));

        let runtime = RuntimeContext::new(self.run_id, &self.spec, self.event.clone(), instance.clone());
        let request = ProvisionRequest::new(&self.spec.provision, &instance, runtime.base_env())
            .with_command_timeout(self.command_timeout)
            .with_output_limit(self.output_limit);

        let (provisioned, attempts) = provision_with_retry(
            self.provisioner.as_ref(),
            &mut lease,
            &request,
            self.retry,
            &self.signal,
            &self.event_tx,
        )
        .await;

        let mut outcome = match provisioned {
            Ok(()) => {
                let outcome = self
                    .executor
                    .run(&runtime, &self.spec.steps, &mut lease, &self.signal)
                    .await;
                self.provisioner.teardown(&mut lease, &request).await;
                outcome
            }
            Err(error) => {
                tracing::warn!(job = %job_name, attempts, reason = %error.reason, "provisioning failed");
                let steps = skipped_steps(&self.spec.steps, "provisioning failed");
                let mut outcome = JobOutcome::provision_failed(instance.clone(), error, steps);
                outcome.worker_id = Some(lease.id());
                outcome
            }
        };

        outcome.provision_attempts = attempts;
        outcome.started_at = Some(started_at);
        outcome.duration = start.elapsed();

        tracing::info!(job = %job_name, status = ?outcome.status, "job completed");
        self.event_tx.send_event(ExecutionEvent::job_completed(
            &job_name,
            instance.index,
            outcome.status,
            outcome.duration,
        ));

        lease.release().await;
        outcome
    }
}

fn skipped_steps(steps: &[Step], reason: &str) -> Vec<StepRecord> {
    steps
        .iter()
        .enumerate()
        .map(|(index, step)| StepRecord {
            index,
            name: step.display_name(),
            optional: step.continue_on_error,
            outcome: StepOutcome::skipped(reason),
            duration: Duration::ZERO,
        })
        .collect()
}

/// A run in flight
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    total_jobs: usize,
    cancel: CancelHandle,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn total_jobs(&self) -> usize {
        self.total_jobs
    }

    /// Cancel every in-flight job. Completed outcomes are kept.
    pub fn cancel(&self) {
        tracing::info!(run_id = %self.run_id, "run cancellation requested");
        self.cancel.cancel();
    }

    /// A handle that can cancel this run from elsewhere (e.g. a signal handler)
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the run to finish. Timeouts and cancellation are reported in
    /// [`RunOutcome::failure`]; use [`RunOutcome::into_result`] to turn them
    /// into errors.
    pub async fn wait(self) -> ServiceResult<RunOutcome> {
        self.join
            .await
            .map_err(|e| ServiceError::Internal(format!("run aggregator failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::execution::matrix::MatrixBuilder;
    use crate::spec::models::MatrixAxis;
    use crate::spec::trigger::TriggerKind;
    use crate::worker::WorkerHandle;

    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(temp: &tempfile::TempDir) -> EngineConfig {
        EngineConfig::default()
            .with_working_dir(temp.path())
            .with_scratch_root(temp.path().join("scratch"))
            .with_provision_backoff(Duration::from_millis(1))
    }

    fn python_spec() -> RunSpec {
        let mut spec = RunSpec::new("integration");
        for axis in MatrixBuilder::new()
            .axis(
                "python-version",
                ["3.9.x", "3.10.x", "3.11.x", "3.12.x", "3.13.x"],
            )
            .axis("os", ["macos-latest"])
            .build()
        {
            spec = spec.with_axis(axis);
        }
        spec
    }

    struct AlwaysDenied;

    #[async_trait]
    impl Provisioner for AlwaysDenied {
        async fn provision(
            &self,
            _worker: &mut WorkerHandle,
            _request: &ProvisionRequest,
            _cancel: &CancelSignal,
        ) -> Result<(), ProvisionError> {
            Err(ProvisionError::permission("registry login: unauthorized"))
        }
    }

    #[derive(Default)]
    struct Tracking {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provisioner for Tracking {
        async fn provision(
            &self,
            _worker: &mut WorkerHandle,
            _request: &ProvisionRequest,
            _cancel: &CancelSignal,
        ) -> Result<(), ProvisionError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&self, _worker: &mut WorkerHandle, _request: &ProvisionRequest) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    #[async_trait]
    impl Provisioner for Panicking {
        async fn provision(
            &self,
            _worker: &mut WorkerHandle,
            _request: &ProvisionRequest,
            _cancel: &CancelSignal,
        ) -> Result<(), ProvisionError> {
            panic!("provisioner bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_job_releases_worker_and_is_incomplete() {
        let temp = tempfile::tempdir().unwrap();
        let mut spec = RunSpec::new("panics").with_step(Step::script("true"));
        for axis in MatrixBuilder::new().axis("os", ["alpha", "beta"]).build() {
            spec = spec.with_axis(axis);
        }
        let scheduler = JobScheduler::new(spec, config(&temp)).with_provisioner(Panicking);

        let outcome = scheduler
            .dispatch(TriggerEvent::manual())
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.count(JobStatus::Incomplete), 2);
        assert_eq!(outcome.jobs[0].instance.name, "panics (alpha)");
        assert_eq!(outcome.jobs[1].instance.name, "panics (beta)");

        for _ in 0..100 {
            let stats = scheduler.pool().stats();
            if stats.released == stats.acquired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = scheduler.pool().stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
    }

    #[tokio::test]
    async fn test_unmatched_trigger_creates_no_run() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec().with_step(Step::script("true"));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let handle = scheduler
            .dispatch(TriggerEvent::external(None, serde_json::json!({})))
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(scheduler.pool().stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let temp = tempfile::tempdir().unwrap();
        let spec = RunSpec::new("nightly")
            .with_triggers(vec![TriggerKind::External {
                types: vec!["nightly".to_string()],
            }])
            .with_step(Step::script("true"));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let other = TriggerEvent::external(Some("release".into()), serde_json::Value::Null);
        assert!(scheduler.dispatch(other).unwrap().is_none());

        let nightly = TriggerEvent::external(Some("nightly".into()), serde_json::Value::Null);
        let outcome = scheduler.dispatch(nightly).unwrap().unwrap().wait().await.unwrap();
        assert!(outcome.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_observed_matrix_runs_five_jobs() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec().with_step(Step::script(
            "test \"$MATRIX_PYTHON_VERSION\" = \"${{ matrix.python-version }}\" && test \"$MATRIX_OS\" = macos-latest",
        ));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let handle = scheduler.dispatch(TriggerEvent::manual()).unwrap().unwrap();
        assert_eq!(handle.total_jobs(), 5);
        let outcome = handle.wait().await.unwrap();

        assert!(outcome.is_success());
        let names: Vec<&str> = outcome.jobs.iter().map(|j| j.instance.name.as_str()).collect();
        assert_eq!(names[0], "integration (3.9.x, macos-latest)");
        assert_eq!(names[4], "integration (3.13.x, macos-latest)");

        let stats = scheduler.pool().stats();
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.released, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_is_isolated_to_its_job() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec()
            .with_step(Step::script("test \"$MATRIX_PYTHON_VERSION\" != 3.11.x"))
            .with_step(Step::script("true").named("after"));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let outcome = scheduler
            .dispatch(TriggerEvent::manual())
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.count(JobStatus::Success), 4);
        let failed = &outcome.jobs[2];
        assert_eq!(failed.status, JobStatus::Failure);
        assert!(failed.steps[1].outcome.is_skipped());
        assert_eq!(scheduler.pool().stats().released, 5);
    }

    #[tokio::test]
    async fn test_worker_released_once_when_provisioning_fails() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec().with_step(Step::script("true"));
        let scheduler = JobScheduler::new(spec, config(&temp)).with_provisioner(AlwaysDenied);

        let outcome = scheduler
            .dispatch(TriggerEvent::manual())
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.count(JobStatus::Failure), 5);
        for job in &outcome.jobs {
            assert!(job.provision_error.is_some());
            assert_eq!(job.provision_attempts, 1);
            assert!(job.steps.iter().all(|s| s.outcome.is_skipped()));
        }
        let stats = scheduler.pool().stats();
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.released, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrency_limit() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec().with_step(Step::script("sleep 0.2"));
        let tracking = Tracking::default();
        let peak = tracking.peak.clone();
        let scheduler = JobScheduler::new(spec, config(&temp).with_max_parallel(Some(2)))
            .with_provisioner(tracking);

        let outcome = scheduler
            .dispatch(TriggerEvent::manual())
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pool().stats().released, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_timeout_marks_incomplete_and_frees_workers() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec().with_step(Step::script("sleep 10"));
        let scheduler = JobScheduler::new(
            spec,
            config(&temp).with_run_timeout(Some(Duration::from_millis(300))),
        );

        let outcome = scheduler
            .dispatch(TriggerEvent::manual())
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.count(JobStatus::Incomplete), 5);
        assert!(matches!(
            outcome.failure,
            Some(RunFailure::Timeout { incomplete: 5, .. })
        ));

        for _ in 0..100 {
            let stats = scheduler.pool().stats();
            if stats.released == stats.acquired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let stats = scheduler.pool().stats();
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.released, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_run() {
        let temp = tempfile::tempdir().unwrap();
        let spec = python_spec().with_step(Step::script("sleep 10"));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let handle = scheduler.dispatch(TriggerEvent::manual()).unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.failure, Some(RunFailure::Cancelled));
        assert_eq!(outcome.count(JobStatus::Cancelled), 5);
        assert!(matches!(outcome.into_result(), Err(ServiceError::Cancelled)));
        assert_eq!(scheduler.pool().stats().released, 5);
    }

    #[tokio::test]
    async fn test_configuration_error_before_any_worker() {
        let temp = tempfile::tempdir().unwrap();
        let spec = RunSpec::new("broken")
            .with_axis(MatrixAxis::new("os", Vec::<String>::new()))
            .with_step(Step::script("true"));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let err = scheduler.dispatch(TriggerEvent::manual()).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(scheduler.pool().stats().acquired, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_payload_reaches_steps() {
        let temp = tempfile::tempdir().unwrap();
        let spec = RunSpec::new("dispatch")
            .with_triggers(vec![TriggerKind::External { types: vec![] }])
            .with_step(Step::script(
                "test \"$CI_EVENT_PAYLOAD\" = '{\"ref\":\"main\"}' && test \"$CI_EVENT_NAME\" = external",
            ));
        let scheduler = JobScheduler::new(spec, config(&temp));

        let event = TriggerEvent::external(None, serde_json::json!({"ref": "main"}));
        let outcome = scheduler.dispatch(event).unwrap().unwrap().wait().await.unwrap();
        assert!(outcome.is_success());
    }
}
