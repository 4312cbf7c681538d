// CLI Commands
// Shared helpers for loading RunSpecs and mapping failures onto exit codes

pub mod expand;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;
use std::process::ExitCode;

use matrix_service::{ActionRegistry, RunSpec, RunSpecParser, ServiceError};

/// A job or the run failed
pub const EXIT_FAILURE: u8 = 1;
/// The RunSpec or the invocation is invalid; nothing ran
pub const EXIT_CONFIGURATION: u8 = 2;

/// Parse and validate a RunSpec, printing the problem and returning the
/// configuration exit code when it is not usable.
pub fn load_spec(path: &Path, actions: &ActionRegistry) -> Result<RunSpec, ExitCode> {
    if !path.exists() {
        output::error(&format!("RunSpec file not found: {}", path.display()));
        return Err(ExitCode::from(EXIT_CONFIGURATION));
    }

    RunSpecParser::from_file(path, actions).map_err(|e| configuration_error(&e))
}

/// Report an error that stops a run before any job starts
pub fn configuration_error(error: &ServiceError) -> ExitCode {
    match error {
        ServiceError::Configuration(message) => output::error(message),
        ServiceError::Yaml(e) => output::error(&format!("invalid YAML: {}", e)),
        other => output::error(&other.to_string()),
    }
    ExitCode::from(EXIT_CONFIGURATION)
}
