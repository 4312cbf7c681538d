// Outcomes
// Step, job and run results; the machine-readable reporting surface

use crate::error::{ProvisionError, ProvisionFailureKind, ServiceError, ServiceResult};
use crate::execution::matrix::JobInstance;
use crate::spec::trigger::TriggerEvent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::path::PathBuf;
use std::time::Duration;

/// Output captured from a step's process (or produced by an action)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Earlier output was dropped to stay under the capture limit
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    /// Log file holding this output, relative to the report directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl CapturedOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Output consisting of a single diagnostic message
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(String::new(), message)
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Result of a single step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success {
        exit_code: Option<i32>,
        captured_output: CapturedOutput,
    },
    Failure {
        exit_code: Option<i32>,
        captured_output: CapturedOutput,
    },
    Skipped {
        reason: String,
    },
}

impl StepOutcome {
    pub fn success(exit_code: Option<i32>, captured_output: CapturedOutput) -> Self {
        Self::Success {
            exit_code,
            captured_output,
        }
    }

    pub fn failure(exit_code: Option<i32>, captured_output: CapturedOutput) -> Self {
        Self::Failure {
            exit_code,
            captured_output,
        }
    }

    /// Failure without a process behind it (spawn error, unknown action, ...)
    pub fn failure_message(message: impl Into<String>) -> Self {
        Self::failure(None, CapturedOutput::message(message))
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Success { exit_code, .. } | Self::Failure { exit_code, .. } => *exit_code,
            Self::Skipped { .. } => None,
        }
    }

    pub fn captured_output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::Success {
                captured_output, ..
            }
            | Self::Failure {
                captured_output, ..
            } => Some(captured_output),
            Self::Skipped { .. } => None,
        }
    }

    pub fn captured_output_mut(&mut self) -> Option<&mut CapturedOutput> {
        match self {
            Self::Success {
                captured_output, ..
            }
            | Self::Failure {
                captured_output, ..
            } => Some(captured_output),
            Self::Skipped { .. } => None,
        }
    }
}

/// A step outcome together with what produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    /// Failure of an optional step does not fail the job
    pub optional: bool,
    pub outcome: StepOutcome,
    #[serde(with = "duration_ms", rename = "duration_ms")]
    pub duration: Duration,
}

impl StepRecord {
    /// A failure that counts against the job
    pub fn is_blocking_failure(&self) -> bool {
        !self.optional && self.outcome.is_failure()
    }
}

/// Overall status of one job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failure,
    Cancelled,
    /// Did not report before the run deadline
    Incomplete,
}

/// Result of one job instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub instance: JobInstance,
    pub status: JobStatus,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_error: Option<ProvisionError>,
    #[serde(default)]
    pub provision_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms", rename = "duration_ms")]
    pub duration: Duration,
}

impl JobOutcome {
    /// Build an outcome from executed steps.
    ///
    /// The job fails iff a non-optional step failed; cancellation wins over both.
    pub fn from_steps(instance: JobInstance, steps: Vec<StepRecord>, cancelled: bool) -> Self {
        let status = if cancelled {
            JobStatus::Cancelled
        } else if steps.iter().any(StepRecord::is_blocking_failure) {
            JobStatus::Failure
        } else {
            JobStatus::Success
        };

        Self {
            instance,
            status,
            steps,
            provision_error: None,
            provision_attempts: 0,
            worker_id: None,
            started_at: None,
            duration: Duration::ZERO,
        }
    }

    /// Provisioning never reached a ready state; no step ran
    pub fn provision_failed(
        instance: JobInstance,
        error: ProvisionError,
        steps: Vec<StepRecord>,
    ) -> Self {
        let status = if error.kind == ProvisionFailureKind::Cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failure
        };
        Self {
            status,
            provision_error: Some(error),
            ..Self::from_steps(instance, steps, false)
        }
    }

    /// Job ended before it could start (no worker, cancelled while queued)
    pub fn not_started(instance: JobInstance, status: JobStatus) -> Self {
        Self {
            status,
            ..Self::from_steps(instance, Vec::new(), false)
        }
    }

    /// Placeholder for a job that never reported
    pub fn incomplete(instance: JobInstance) -> Self {
        Self::not_started(instance, JobStatus::Incomplete)
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }

    /// The step that failed the job, if any
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.is_blocking_failure())
    }
}

/// Overall verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

/// Why a run failed as a whole, beyond individual job failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RunFailure {
    Timeout {
        #[serde(with = "duration_ms", rename = "deadline_ms")]
        deadline: Duration,
        incomplete: usize,
    },
    Cancelled,
}

/// Result of a run: every job instance, always, in matrix order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub run_name: String,
    pub trigger: TriggerEvent,
    pub status: RunStatus,
    pub jobs: Vec<JobOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| !j.is_success())
    }

    pub fn incomplete_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Incomplete)
    }

    /// Convert run-level failures into errors, keeping job failures as data
    pub fn into_result(self) -> ServiceResult<RunOutcome> {
        match &self.failure {
            Some(RunFailure::Timeout {
                deadline,
                incomplete,
            }) => Err(ServiceError::Timeout {
                deadline: *deadline,
                incomplete: *incomplete,
            }),
            Some(RunFailure::Cancelled) => Err(ServiceError::Cancelled),
            None => Ok(self),
        }
    }

    pub fn to_json_pretty(&self) -> ServiceResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Durations as whole milliseconds in reports
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
