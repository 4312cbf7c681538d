use super::load_spec;
use crate::output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use color_eyre::Result;

use matrix_service::spec::TriggerKind;
use matrix_service::{ActionRegistry, MatrixExpander};

/// Validate a RunSpec YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the RunSpec YAML file
    pub spec: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<ExitCode> {
    output::status("Validating", &format!("{}", args.spec.display()));

    let actions = ActionRegistry::default();
    let spec = match load_spec(&args.spec, &actions) {
        Ok(spec) => spec,
        Err(code) => return Ok(code),
    };

    let triggers: Vec<String> = spec
        .triggers
        .iter()
        .map(|kind| match kind {
            TriggerKind::Manual => "manual".to_string(),
            TriggerKind::External { types } if types.is_empty() => "external".to_string(),
            TriggerKind::External { types } => format!("external ({})", types.join(", ")),
        })
        .collect();
    output::check(&format!("Triggers: {}", triggers.join(", ")));

    let jobs = MatrixExpander::count(&spec.axes)?;
    output::check(&format!(
        "Matrix: {} axes, {} job instances",
        spec.axes.len(),
        jobs
    ));
    output::check(&format!("Steps: {}", spec.steps.len()));
    if !spec.provision.is_empty() {
        output::check("Provisioning configured");
    }

    output::success(&format!("RunSpec '{}' is valid", spec.name));
    Ok(ExitCode::SUCCESS)
}
