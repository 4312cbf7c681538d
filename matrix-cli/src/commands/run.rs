use super::{configuration_error, load_spec, EXIT_CONFIGURATION, EXIT_FAILURE};
use crate::output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, ValueEnum};
use color_eyre::Result;
use indexmap::IndexMap;

use matrix_service::{
    progress_channel, ActionRegistry, EngineConfig, ExecutionEvent, JobScheduler, JobStatus,
    ReportWriter, RunFailure, RunOutcome, RunStatus, TriggerEvent,
};

/// Kind of trigger event to deliver
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Manual,
    External,
}

/// Run a RunSpec locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the RunSpec YAML file
    pub spec: PathBuf,

    /// Trigger event to deliver
    #[arg(long, value_enum, default_value = "manual")]
    pub event: EventKind,

    /// Event type for external dispatch
    #[arg(long, value_name = "TYPE")]
    pub event_type: Option<String>,

    /// External payload as JSON text, or @path to read it from a file
    #[arg(long, value_name = "JSON|@FILE")]
    pub payload: Option<String>,

    /// Input for manual dispatch (can be repeated, format: name=value)
    #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,

    /// Maximum job instances running at once
    #[arg(long, short = 'j', env = "MATRIX_RUNNER_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,

    /// Deadline for the whole run, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Timeout for steps without timeout-minutes, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub step_timeout: Option<u64>,

    /// Provisioning retries after the first attempt
    #[arg(long, value_name = "N")]
    pub provision_retries: Option<u32>,

    /// Repository checkout the steps run in
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Root for per-worker scratch directories
    #[arg(long, value_name = "DIR", env = "MATRIX_RUNNER_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Write run.json and step logs to this directory
    #[arg(long, value_name = "DIR", env = "MATRIX_RUNNER_REPORT_DIR")]
    pub report: Option<PathBuf>,

    /// Do not print step output
    #[arg(long, short)]
    pub quiet: bool,
}

pub async fn execute(args: RunArgs) -> Result<ExitCode> {
    let actions = ActionRegistry::default();
    let spec = match load_spec(&args.spec, &actions) {
        Ok(spec) => spec,
        Err(code) => return Ok(code),
    };

    let event = match trigger_event(&args) {
        Ok(event) => event,
        Err(message) => {
            output::error(&message);
            return Ok(ExitCode::from(EXIT_CONFIGURATION));
        }
    };

    let mut config = EngineConfig::default()
        .with_max_parallel(args.max_parallel)
        .with_run_timeout(args.timeout.map(Duration::from_secs))
        .with_step_timeout(args.step_timeout.map(Duration::from_secs))
        .with_report_dir(args.report.clone());
    if let Some(retries) = args.provision_retries {
        config = config.with_provision_retries(retries);
    }
    if let Some(dir) = &args.working_dir {
        if !dir.is_dir() {
            output::error(&format!("Working directory not found: {}", dir.display()));
            return Ok(ExitCode::from(EXIT_CONFIGURATION));
        }
        config = config.with_working_dir(dir);
    }
    if let Some(dir) = &args.scratch_dir {
        config = config.with_scratch_root(dir);
    }
    let report_dir = config.report_dir.clone();

    let (tx, mut rx) = progress_channel();
    let scheduler = JobScheduler::new(spec, config)
        .with_actions(actions)
        .with_progress(tx);

    let handle = match scheduler.dispatch(event) {
        Ok(Some(handle)) => handle,
        Ok(None) => {
            output::warning(&format!(
                "RunSpec '{}' does not declare this trigger; nothing to run",
                scheduler.spec().name
            ));
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Ok(configuration_error(&e)),
    };
    // the progress channel closes once every job task is done with it
    drop(scheduler);

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run");
            canceller.cancel();
        }
    });

    while let Some(event) = rx.recv().await {
        let done = matches!(event, ExecutionEvent::RunCompleted { .. });
        render_event(&event, args.quiet);
        if done {
            break;
        }
    }

    let mut outcome = handle.wait().await?;

    if let Some(dir) = report_dir {
        let path = ReportWriter::new(dir).write(&mut outcome)?;
        output::info(&format!("Report written to {}", path.display()));
    }

    print_summary(&outcome);

    Ok(match outcome.status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::Failure => ExitCode::from(EXIT_FAILURE),
    })
}

fn trigger_event(args: &RunArgs) -> Result<TriggerEvent, String> {
    match args.event {
        EventKind::Manual => {
            if args.payload.is_some() || args.event_type.is_some() {
                return Err("--payload and --event-type require --event external".to_string());
            }
            let inputs = parse_inputs(&args.inputs)?;
            Ok(TriggerEvent::ManualDispatch { inputs })
        }
        EventKind::External => {
            if !args.inputs.is_empty() {
                return Err("--input requires --event manual".to_string());
            }
            let payload = match &args.payload {
                Some(raw) => parse_payload(raw)?,
                None => serde_json::Value::Null,
            };
            Ok(TriggerEvent::external(args.event_type.clone(), payload))
        }
    }
}

fn parse_inputs(raw: &[String]) -> Result<IndexMap<String, String>, String> {
    let mut inputs = IndexMap::new();
    for item in raw {
        match item.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                inputs.insert(name.to_string(), value.to_string());
            }
            _ => {
                return Err(format!(
                    "Invalid input format '{}'. Expected name=value",
                    item
                ))
            }
        }
    }
    Ok(inputs)
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, String> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read payload file '{}': {}", path, e))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| format!("Payload is not valid JSON: {}", e))
}

fn render_event(event: &ExecutionEvent, quiet: bool) {
    match event {
        ExecutionEvent::RunStarted {
            run_name,
            total_jobs,
            ..
        } => {
            output::run_header(run_name, *total_jobs);
        }

        ExecutionEvent::RunCompleted {
            status, duration, ..
        } => {
            if *status == RunStatus::Success {
                output::success(&format!(
                    "Run completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!("Run failed after {:.2}s", duration.as_secs_f64()));
            }
        }

        ExecutionEvent::TriggerIgnored { event_name, reason } => {
            output::warning(&format!("Event '{}' ignored: {}", event_name, reason));
        }

        ExecutionEvent::JobStarted {
            job_name,
            worker_id,
            total_steps,
            ..
        } => {
            output::status(
                "Starting",
                &format!("{} on worker {} ({} steps)", job_name, worker_id, total_steps),
            );
        }

        ExecutionEvent::ProvisionStarted { job_name, attempt } => {
            if *attempt > 1 {
                output::info(&format!("{}: provisioning, attempt {}", job_name, attempt));
            }
        }

        ExecutionEvent::ProvisionFailed {
            job_name,
            attempt,
            reason,
            will_retry,
        } => {
            let retry = if *will_retry { ", retrying" } else { "" };
            output::warning(&format!(
                "{}: provisioning attempt {} failed: {}{}",
                job_name, attempt, reason, retry
            ));
        }

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            duration,
            ..
        } => {
            let line = format!(
                "  Job '{}' {} ({:.2}s)",
                job_name,
                status_label(*status),
                duration.as_secs_f64()
            );
            if *status == JobStatus::Success {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::StepStarted {
            job_name,
            step_name,
            step_index,
        } => {
            if !quiet {
                output::dim(&format!("  [{}] Step {}: {}", job_name, step_index + 1, step_name));
            }
        }

        ExecutionEvent::StepOutput {
            job_name,
            output: text,
            is_error,
            ..
        } => {
            if quiet {
                return;
            }
            for line in text.lines() {
                if *is_error {
                    output::step_error(job_name, line);
                } else {
                    output::step_output(job_name, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            job_name,
            step_name,
            success,
            duration,
            exit_code,
            ..
        } => {
            if *success {
                if !quiet {
                    output::dim_success(&format!(
                        "  [{}] {} OK ({:.2}s)",
                        job_name,
                        step_name,
                        duration.as_secs_f64()
                    ));
                }
            } else {
                let exit_info = match exit_code {
                    Some(code) => format!("exit code: {}", code),
                    None => "no exit code".to_string(),
                };
                output::dim_failure(&format!(
                    "  [{}] {} FAIL ({:.2}s, {})",
                    job_name,
                    step_name,
                    duration.as_secs_f64(),
                    exit_info
                ));
            }
        }

        ExecutionEvent::StepSkipped {
            job_name,
            step_name,
            reason,
            ..
        } => {
            if !quiet {
                output::dim(&format!("  [{}] {} skipped: {}", job_name, step_name, reason));
            }
        }
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Success => "OK",
        JobStatus::Failure => "FAIL",
        JobStatus::Cancelled => "CANCELLED",
        JobStatus::Incomplete => "INCOMPLETE",
    }
}

fn print_summary(outcome: &RunOutcome) {
    println!();
    for job in &outcome.jobs {
        let detail = if let Some(error) = &job.provision_error {
            format!(" - {}", error.reason)
        } else if let Some(step) = job.failed_step() {
            format!(" - step '{}' failed", step.name)
        } else {
            String::new()
        };
        println!("{:<12} {}{}", status_label(job.status), job.instance.name, detail);
    }

    match &outcome.failure {
        Some(RunFailure::Timeout {
            deadline,
            incomplete,
        }) => output::error(&format!(
            "Run timed out after {:.0}s: {} job(s) did not report",
            deadline.as_secs_f64(),
            incomplete
        )),
        Some(RunFailure::Cancelled) => output::error("Run was cancelled"),
        None => {}
    }

    println!(
        "{} succeeded, {} failed, {} cancelled, {} incomplete",
        outcome.count(JobStatus::Success),
        outcome.count(JobStatus::Failure),
        outcome.count(JobStatus::Cancelled),
        outcome.count(JobStatus::Incomplete)
    );
}
