// Engine Configuration
// Tunables for scheduling, provisioning and output capture

use crate::utils::{default_scratch_root, resolve_working_dir};

use std::path::PathBuf;
use std::time::Duration;

/// Default cap on captured output per stream (1 MiB)
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Configuration for a [`JobScheduler`](crate::execution::JobScheduler)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum job instances running at once (None = one worker per instance)
    pub max_parallel: Option<usize>,
    /// Deadline for the whole run (None = wait for every job)
    pub run_timeout: Option<Duration>,
    /// Timeout applied to steps that do not declare their own (None = unbounded)
    pub default_step_timeout: Option<Duration>,
    /// Provisioning retries after the first attempt, unless the RunSpec overrides it
    pub provision_retries: u32,
    /// Delay between provisioning attempts
    pub provision_backoff: Duration,
    /// Repository checkout root every worker runs in
    pub working_dir: PathBuf,
    /// Root under which per-worker scratch directories are created
    pub scratch_root: PathBuf,
    /// Maximum bytes kept per captured stream
    pub output_limit: usize,
    /// Where run reports are written (None = no report)
    pub report_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            run_timeout: None,
            default_step_timeout: None,
            provision_retries: 1,
            provision_backoff: Duration::from_secs(2),
            working_dir: resolve_working_dir(),
            scratch_root: default_scratch_root(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            report_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, limit: Option<usize>) -> Self {
        // A limit of zero would deadlock the pool; treat it as unbounded.
        self.max_parallel = limit.filter(|n| *n > 0);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_provision_retries(mut self, retries: u32) -> Self {
        self.provision_retries = retries;
        self
    }

    pub fn with_provision_backoff(mut self, backoff: Duration) -> Self {
        self.provision_backoff = backoff;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = dir.into();
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit.max(1);
        self
    }

    pub fn with_report_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.report_dir = dir;
        self
    }
}
