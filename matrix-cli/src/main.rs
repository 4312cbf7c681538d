// Matrix Runner CLI
// Run, validate and expand build-matrix RunSpecs from the command line

mod commands;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::expand::ExpandArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

#[derive(Parser, Debug)]
#[command(name = "matrix-runner", version, about = "Run build-matrix CI pipelines locally")]
struct Cli {
    /// Log engine internals at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every job instance of a RunSpec
    Run(RunArgs),
    /// Check a RunSpec without running anything
    Validate(ValidateArgs),
    /// Print the job instances a RunSpec expands to
    Expand(ExpandArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose))),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Expand(args) => commands::expand::execute(args),
    }
}

/// Progress is already rendered on the terminal; library logs only surface
/// problems unless `-v` is given.
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "matrix_service=debug,matrix_runner=debug"
    } else {
        "matrix_service=warn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(false), "matrix_service=warn");
        assert!(default_filter(true).contains("matrix_service=debug"));
    }
}
