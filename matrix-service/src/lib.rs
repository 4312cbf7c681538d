// Matrix Service Library
// Build-matrix scheduling and step execution for CI runs

pub mod config;
pub mod error;
pub mod execution;
pub mod report;
pub mod runners;
pub mod spec;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ProvisionError, ProvisionFailureKind, ServiceError, ServiceResult};
pub use report::ReportWriter;

// Re-export spec types
pub use spec::{MatrixAxis, RunSpec, RunSpecParser, Step, TriggerEvent, TriggerKind};

// Re-export execution types
pub use execution::{
    cancel_channel, progress_channel, CancelHandle, CancelSignal, ExecutionEvent, JobInstance,
    JobOutcome, JobScheduler, JobStatus, MatrixExpander, ProgressReceiver, ProgressSender,
    RunFailure, RunHandle, RunOutcome, RunStatus, StepExecutor, StepOutcome,
};

// Re-export runner and worker types
pub use runners::{Action, ActionRegistry, Shell, ShellRunner};
pub use worker::{HostProvisioner, Provisioner, WorkerHandle, WorkerPool};
