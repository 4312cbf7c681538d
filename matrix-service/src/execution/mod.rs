// Execution Engine Module
// Matrix expansion, job scheduling, step execution and result aggregation

pub mod aggregator;
pub mod cancel;
pub mod context;
pub mod events;
pub mod executor;
pub mod matrix;
pub mod outcome;
pub mod scheduler;

// Re-export key types
pub use aggregator::{outcome_channel, OutcomeReceiver, OutcomeSender, ResultAggregator};
pub use cancel::{cancel_channel, CancelHandle, CancelSignal};
pub use context::{RuntimeContext, Scope};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender,
};
pub use executor::StepExecutor;
pub use matrix::{JobInstance, MatrixBuilder, MatrixExpander};
pub use outcome::{
    CapturedOutput, JobOutcome, JobStatus, RunFailure, RunOutcome, RunStatus, StepOutcome,
    StepRecord,
};
pub use scheduler::{JobScheduler, RunHandle};
