use super::load_spec;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use color_eyre::Result;

use matrix_service::{ActionRegistry, MatrixExpander};

/// Print the job instances a RunSpec expands to, in execution order
#[derive(Args, Debug)]
pub struct ExpandArgs {
    /// Path to the RunSpec YAML file
    pub spec: PathBuf,

    /// Print instances as a JSON array
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: ExpandArgs) -> Result<ExitCode> {
    let actions = ActionRegistry::default();
    let spec = match load_spec(&args.spec, &actions) {
        Ok(spec) => spec,
        Err(code) => return Ok(code),
    };

    let instances = MatrixExpander::expand_all(&spec.name, &spec.axes)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(ExitCode::SUCCESS);
    }

    for instance in &instances {
        let values: Vec<String> = instance
            .values
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        println!("{:>3}  {}  [{}]", instance.index, instance.name, values.join(" "));
    }
    Ok(ExitCode::SUCCESS)
}
