// Execution Events
// Progress reporting and event types for matrix runs

use crate::execution::outcome::{JobStatus, RunStatus};

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a run executes
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A run was accepted and its job instances dispatched
    RunStarted {
        run_id: Uuid,
        run_name: String,
        total_jobs: usize,
    },

    /// Every job reported (or the deadline passed)
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
        duration: Duration,
    },

    /// An event arrived that the RunSpec does not declare
    TriggerIgnored { event_name: String, reason: String },

    /// A job instance acquired a worker
    JobStarted {
        job_name: String,
        job_index: usize,
        worker_id: usize,
        total_steps: usize,
    },

    /// A provisioning attempt is starting
    ProvisionStarted {
        job_name: String,
        attempt: u32,
    },

    /// A provisioning attempt failed
    ProvisionFailed {
        job_name: String,
        attempt: u32,
        reason: String,
        will_retry: bool,
    },

    /// A job instance finished
    JobCompleted {
        job_name: String,
        job_index: usize,
        status: JobStatus,
        duration: Duration,
    },

    /// Step execution started
    StepStarted {
        job_name: String,
        step_name: String,
        step_index: usize,
    },

    /// One line of step output (stdout/stderr)
    StepOutput {
        job_name: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        job_name: String,
        step_name: String,
        step_index: usize,
        success: bool,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped because an earlier step failed or the job was cancelled
    StepSkipped {
        job_name: String,
        step_name: String,
        step_index: usize,
        reason: String,
    },
}

impl ExecutionEvent {
    pub fn run_started(run_id: Uuid, run_name: impl Into<String>, total_jobs: usize) -> Self {
        Self::RunStarted {
            run_id,
            run_name: run_name.into(),
            total_jobs,
        }
    }

    pub fn run_completed(run_id: Uuid, status: RunStatus, duration: Duration) -> Self {
        Self::RunCompleted {
            run_id,
            status,
            duration,
        }
    }

    pub fn job_started(
        job_name: impl Into<String>,
        job_index: usize,
        worker_id: usize,
        total_steps: usize,
    ) -> Self {
        Self::JobStarted {
            job_name: job_name.into(),
            job_index,
            worker_id,
            total_steps,
        }
    }

    pub fn job_completed(
        job_name: impl Into<String>,
        job_index: usize,
        status: JobStatus,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            job_name: job_name.into(),
            job_index,
            status,
            duration,
        }
    }

    pub fn step_started(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
        }
    }

    pub fn step_output(
        job_name: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job_name: job_name.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        success: bool,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
            success,
            duration,
            exit_code,
        }
    }

    pub fn step_skipped(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
            reason: reason.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();
        let run_id = Uuid::new_v4();

        tx.send_event(ExecutionEvent::run_started(run_id, "integration", 5));
        tx.send_event(ExecutionEvent::job_started("integration (3.9.x)", 0, 1, 4));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::RunStarted { total_jobs: 5, .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ExecutionEvent::JobStarted { worker_id: 1, .. }));
    }

    #[test]
    fn test_event_construction() {
        let event = ExecutionEvent::job_completed(
            "integration (3.10.x)",
            1,
            JobStatus::Failure,
            Duration::from_secs(30),
        );

        if let ExecutionEvent::JobCompleted {
            job_name,
            job_index,
            status,
            duration,
        } = event
        {
            assert_eq!(job_name, "integration (3.10.x)");
            assert_eq!(job_index, 1);
            assert_eq!(status, JobStatus::Failure);
            assert_eq!(duration, Duration::from_secs(30));
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::run_started(Uuid::new_v4(), "test", 1));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::step_started("nobody listening", "step", 0));
    }
}
