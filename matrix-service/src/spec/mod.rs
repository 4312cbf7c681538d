// RunSpec Module
// Document models, trigger events and the parser/validator

pub mod models;
pub mod parser;
pub mod trigger;

pub use models::{
    ActionStep, EventConfig, MatrixAxis, MatrixBlock, ProvisionConfig, RunSpec, RunSpecDocument,
    RuntimeConfig, ScriptStep, ServiceConfig, Step, StepDocument, StepKind, TriggerConfig,
};
pub use parser::RunSpecParser;
pub use trigger::{TriggerEvent, TriggerKind};
