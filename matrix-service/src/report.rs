// Run Report
// Writes a RunOutcome as run.json plus one log file per captured step output

use crate::error::ServiceResult;
use crate::execution::outcome::{CapturedOutput, RunOutcome};
use crate::utils::slugify;

use std::fs;
use std::path::{Path, PathBuf};

/// File name of the machine-readable report inside the report directory
pub const REPORT_FILE: &str = "run.json";

/// Writes run reports under a directory
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write step logs to `logs/<job>/<step>.log`, record their relative
    /// paths in `outcome`, then write `run.json`. Returns the report path.
    pub fn write(&self, outcome: &mut RunOutcome) -> ServiceResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        for job in &mut outcome.jobs {
            let job_dir = PathBuf::from("logs").join(format!(
                "{:03}-{}",
                job.instance.index,
                slugify(&job.instance.name)
            ));

            for step in &mut job.steps {
                let index = step.index;
                let Some(captured) = step.outcome.captured_output_mut() else {
                    continue;
                };
                if captured.is_empty() {
                    continue;
                }

                let relative = job_dir.join(format!("{:02}.log", index));
                let path = self.dir.join(&relative);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, render_log(captured))?;
                captured.log_path = Some(relative);
            }
        }

        let report = self.dir.join(REPORT_FILE);
        fs::write(&report, outcome.to_json_pretty()?)?;
        tracing::info!(path = %report.display(), "run report written");
        Ok(report)
    }
}

fn render_log(captured: &CapturedOutput) -> String {
    let mut log = String::with_capacity(captured.stdout.len() + captured.stderr.len() + 32);
    if captured.truncated {
        log.push_str("[output truncated]\n");
    }
    log.push_str(&captured.stdout);
    if !captured.stderr.is_empty() {
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str("--- stderr ---\n");
        log.push_str(&captured.stderr);
    }
    log
}
