// Step Executor
// Runs one job instance's steps strictly in order with fail-fast semantics

use crate::config::DEFAULT_OUTPUT_LIMIT;
use crate::execution::cancel::CancelSignal;
use crate::execution::context::RuntimeContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::outcome::{JobOutcome, StepOutcome, StepRecord};
use crate::runners::{ActionRegistry, OutputCallback, Runner, ShellRunner, StepContext};
use crate::spec::models::Step;
use crate::worker::WorkerHandle;

use chrono::Utc;

use std::sync::Arc;
use std::time::{Duration, Instant};

const SKIP_AFTER_FAILURE: &str = "previous step failed";
const SKIP_AFTER_CANCEL: &str = "run was cancelled";

/// Executes the steps of a single job instance on its worker
#[derive(Debug, Clone)]
pub struct StepExecutor {
    shell: ShellRunner,
    actions: Arc<ActionRegistry>,
    default_step_timeout: Option<Duration>,
    output_limit: usize,
    event_tx: Option<ProgressSender>,
}

impl StepExecutor {
    pub fn new(actions: Arc<ActionRegistry>) -> Self {
        Self {
            shell: ShellRunner::new(),
            actions,
            default_step_timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            event_tx: None,
        }
    }

    /// Timeout for steps without `timeout-minutes`
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Set progress event sender for real-time updates
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run `steps` in order on `worker`. Never fails: every step appears in
    /// the outcome, executed or explicitly skipped.
    pub async fn run(
        &self,
        runtime: &RuntimeContext,
        steps: &[Step],
        worker: &mut WorkerHandle,
        cancel: &CancelSignal,
    ) -> JobOutcome {
        let start = Instant::now();
        let started_at = Utc::now();
        let job_name = runtime.instance.name.clone();

        let mut records = Vec::with_capacity(steps.len());
        let mut skip_reason: Option<&'static str> = None;

        for (index, step) in steps.iter().enumerate() {
            let step_name = step.display_name();

            if skip_reason.is_none() && cancel.is_cancelled() {
                skip_reason = Some(SKIP_AFTER_CANCEL);
            }

            if let Some(reason) = skip_reason {
                self.event_tx.send_event(ExecutionEvent::step_skipped(
                    &job_name, &step_name, index, reason,
                ));
                records.push(StepRecord {
                    index,
                    name: step_name,
                    optional: step.continue_on_error,
                    outcome: StepOutcome::skipped(reason),
                    duration: Duration::ZERO,
                });
                continue;
            }

            self.event_tx
                .send_event(ExecutionEvent::step_started(&job_name, &step_name, index));
            tracing::debug!(job = %job_name, step = %step_name, index, "step started");

            let step_start = Instant::now();
            let env = runtime.step_env(worker, step);
            let ctx = StepContext {
                runtime,
                step_index: index,
                env: &env,
                shell: &self.shell,
                actions: &self.actions,
                timeout: step.timeout.or(self.default_step_timeout),
                output_limit: self.output_limit,
                cancel,
                on_output: self.output_callback(&job_name, index),
            };
            let outcome = step.execute(worker, &ctx).await;
            let duration = step_start.elapsed();

            self.event_tx.send_event(ExecutionEvent::step_completed(
                &job_name,
                &step_name,
                index,
                outcome.is_success(),
                duration,
                outcome.exit_code(),
            ));

            if outcome.is_failure() {
                if cancel.is_cancelled() {
                    skip_reason = Some(SKIP_AFTER_CANCEL);
                } else if step.continue_on_error {
                    tracing::warn!(job = %job_name, step = %step_name, "optional step failed, continuing");
                } else {
                    tracing::warn!(
                        job = %job_name,
                        step = %step_name,
                        exit_code = ?outcome.exit_code(),
                        "step failed, skipping remaining steps"
                    );
                    skip_reason = Some(SKIP_AFTER_FAILURE);
                }
            }

            records.push(StepRecord {
                index,
                name: step_name,
                optional: step.continue_on_error,
                outcome,
                duration,
            });
        }

        let cancelled = skip_reason == Some(SKIP_AFTER_CANCEL);
        let mut outcome = JobOutcome::from_steps(runtime.instance.clone(), records, cancelled);
        outcome.worker_id = Some(worker.id);
        outcome.started_at = Some(started_at);
        outcome.duration = start.elapsed();
        outcome
    }

    fn output_callback(&self, job_name: &str, step_index: usize) -> Option<OutputCallback> {
        let tx = self.event_tx.clone()?;
        let job_name = job_name.to_string();
        let callback: OutputCallback = Arc::new(move |line: &str, is_error: bool| {
            tx.send_event(ExecutionEvent::step_output(
                job_name.clone(),
                step_index,
                line,
                is_error,
            ));
        });
        Some(callback)
    }
}
