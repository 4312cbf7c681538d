// Environment Provisioner
// Prepares a worker (runtime, services) before any step runs, with bounded retries

use crate::config::DEFAULT_OUTPUT_LIMIT;
use crate::error::ProvisionError;
use crate::execution::cancel::CancelSignal;
use crate::execution::context::Scope;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobInstance;
use crate::runners::shell::{Shell, ShellConfig, ShellOutput, ShellRunner};
use crate::spec::models::ProvisionConfig;
use crate::worker::pool::WorkerHandle;

use async_trait::async_trait;

use std::collections::HashMap;
use std::time::Duration;

/// Everything a provisioner needs to know about one job instance
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub job_name: String,
    /// Value of the runtime axis for this instance
    pub runtime_version: Option<String>,
    pub config: ProvisionConfig,
    /// Base environment for provisioning commands
    pub env: HashMap<String, String>,
    /// Timeout for each provisioning command
    pub command_timeout: Option<Duration>,
    pub output_limit: usize,
}

impl ProvisionRequest {
    pub fn new(config: &ProvisionConfig, instance: &JobInstance, env: HashMap<String, String>) -> Self {
        let runtime_version = config
            .runtime
            .as_ref()
            .and_then(|runtime| instance.value(&runtime.axis))
            .map(str::to_string);

        Self {
            job_name: instance.name.clone(),
            runtime_version,
            config: config.clone(),
            env,
            command_timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }
}

/// Brings a worker to a ready state for one job instance
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Prepare the worker. Must leave nothing running on failure that
    /// [`teardown`](Provisioner::teardown) cannot stop.
    async fn provision(
        &self,
        worker: &mut WorkerHandle,
        request: &ProvisionRequest,
        cancel: &CancelSignal,
    ) -> Result<(), ProvisionError>;

    /// Stop whatever provisioning started. Failures are logged, never fatal.
    async fn teardown(&self, _worker: &mut WorkerHandle, _request: &ProvisionRequest) {}
}

/// Provisioner running the configured commands on the host with the default shell
#[derive(Debug, Clone, Default)]
pub struct HostProvisioner {
    shell: ShellRunner,
}

impl HostProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_command(
        &self,
        command: &str,
        worker: &WorkerHandle,
        request: &ProvisionRequest,
        cancel: &CancelSignal,
    ) -> ShellOutput {
        let mut env = request.env.clone();
        env.extend(worker.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let config = ShellConfig {
            timeout: request.command_timeout,
            output_limit: request.output_limit,
            scratch_dir: Some(worker.scratch_dir.clone()),
        };
        self.shell
            .run(
                &Shell::Default,
                command,
                &env,
                &worker.checkout_dir,
                &config,
                cancel,
                None,
            )
            .await
    }
}

#[async_trait]
impl Provisioner for HostProvisioner {
    async fn provision(
        &self,
        worker: &mut WorkerHandle,
        request: &ProvisionRequest,
        cancel: &CancelSignal,
    ) -> Result<(), ProvisionError> {
        if let Some(runtime) = &request.config.runtime {
            let version = request.runtime_version.as_deref().ok_or_else(|| {
                ProvisionError::configuration(format!(
                    "job has no value for runtime axis '{}'",
                    runtime.axis
                ))
            })?;

            let scope = Scope::new(&request.env).with_version(Some(version));
            if let Some(install) = &runtime.install {
                let command = scope.substitute(install);
                tracing::info!(job = %request.job_name, %version, "installing runtime");
                let output = self.run_command(&command, worker, request, cancel).await;
                if !output.success() {
                    return Err(classify_failure("runtime install", &output));
                }
            }

            worker.export("RUNTIME_VERSION", version);
            for (key, template) in &runtime.env {
                worker.export(key.clone(), scope.substitute(template));
            }
            worker.runtime_version = Some(version.to_string());
        }

        for service in &request.config.services {
            tracing::info!(job = %request.job_name, service = %service.name, "starting service");
            let output = self.run_command(&service.start, worker, request, cancel).await;
            if !output.success() {
                return Err(classify_failure(&format!("service '{}' start", service.name), &output));
            }
            worker.services.push(service.name.clone());

            if let Some(check) = &service.check {
                let output = self.run_command(check, worker, request, cancel).await;
                if !output.success() {
                    return Err(classify_failure(
                        &format!("service '{}' readiness check", service.name),
                        &output,
                    ));
                }
            }
        }

        Ok(())
    }

    async fn teardown(&self, worker: &mut WorkerHandle, request: &ProvisionRequest) {
        let started = std::mem::take(&mut worker.services);
        for name in started.iter().rev() {
            let Some(service) = request.config.services.iter().find(|s| &s.name == name) else {
                continue;
            };
            let Some(stop) = &service.stop else {
                continue;
            };
            let output = self
                .run_command(stop, worker, request, &CancelSignal::never())
                .await;
            if !output.success() {
                tracing::warn!(
                    job = %request.job_name,
                    service = %name,
                    exit_code = ?output.exit_code,
                    "service stop command failed"
                );
            }
        }
    }
}

/// Decide whether a failed provisioning command is worth retrying
pub fn classify_failure(what: &str, output: &ShellOutput) -> ProvisionError {
    if output.cancelled {
        return ProvisionError::cancelled();
    }

    let detail = output
        .stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no output")
        .trim();
    let reason = match output.exit_code {
        Some(code) => format!("{} failed with exit code {}: {}", what, code, detail),
        None => format!("{} failed: {}", what, detail),
    };

    let text = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
    let denied = ["permission denied", "unauthorized", "authentication", "forbidden"]
        .iter()
        .any(|needle| text.contains(needle));

    if denied || matches!(output.exit_code, Some(126) | Some(127)) {
        ProvisionError::permission(reason)
    } else {
        ProvisionError::transient(reason)
    }
}

/// Retry policy for provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

/// Provision with bounded retries. Returns the final result and the number
/// of attempts made.
pub async fn provision_with_retry(
    provisioner: &dyn Provisioner,
    worker: &mut WorkerHandle,
    request: &ProvisionRequest,
    policy: RetryPolicy,
    cancel: &CancelSignal,
    progress: &Option<ProgressSender>,
) -> (Result<(), ProvisionError>, u32) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return (Err(ProvisionError::cancelled()), attempt - 1);
        }

        progress.send_event(ExecutionEvent::ProvisionStarted {
            job_name: request.job_name.clone(),
            attempt,
        });

        let error = match provisioner.provision(worker, request, cancel).await {
            Ok(()) => return (Ok(()), attempt),
            Err(error) => error,
        };

        let will_retry =
            error.is_retryable() && attempt <= policy.max_retries && !cancel.is_cancelled();
        tracing::warn!(
            job = %request.job_name,
            attempt,
            will_retry,
            reason = %error.reason,
            "provisioning attempt failed"
        );
        progress.send_event(ExecutionEvent::ProvisionFailed {
            job_name: request.job_name.clone(),
            attempt,
            reason: error.reason.clone(),
            will_retry,
        });

        provisioner.teardown(worker, request).await;
        if !will_retry {
            return (Err(error), attempt);
        }

        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(policy.backoff * attempt) => {}
            _ = cancel.cancelled() => return (Err(ProvisionError::cancelled()), attempt),
        }
    }
}
