// Runners Module
// Provides step execution for script steps and named actions

pub mod action;
pub mod shell;

pub use action::{Action, ActionParams, ActionRegistry};
pub use shell::{OutputCallback, Shell, ShellConfig, ShellOutput, ShellRunner};

use crate::execution::cancel::CancelSignal;
use crate::execution::context::RuntimeContext;
use crate::execution::outcome::StepOutcome;
use crate::spec::models::{ActionStep, ScriptStep, Step, StepKind};
use crate::worker::WorkerHandle;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a step can see while it runs
pub struct StepContext<'a> {
    pub runtime: &'a RuntimeContext,
    pub step_index: usize,
    /// Fully composed environment for this step
    pub env: &'a HashMap<String, String>,
    pub shell: &'a ShellRunner,
    pub actions: &'a ActionRegistry,
    pub timeout: Option<Duration>,
    pub output_limit: usize,
    pub cancel: &'a CancelSignal,
    pub on_output: Option<OutputCallback>,
}

impl StepContext<'_> {
    /// Expand `${{ }}` references against this step's environment
    pub fn substitute(&self, template: &str) -> String {
        self.runtime.scope(self.env).substitute(template)
    }

    pub fn shell_config(&self, worker: &WorkerHandle) -> ShellConfig {
        ShellConfig {
            timeout: self.timeout,
            output_limit: self.output_limit,
            scratch_dir: Some(worker.scratch_dir.clone()),
        }
    }

    /// Run a script on the worker with this step's timeout, cancellation and
    /// output streaming
    pub async fn run_script(
        &self,
        shell: &Shell,
        script: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        worker: &WorkerHandle,
    ) -> ShellOutput {
        self.shell
            .run(
                shell,
                script,
                env,
                working_dir,
                &self.shell_config(worker),
                self.cancel,
                self.on_output.clone(),
            )
            .await
    }
}

/// Trait for anything that can execute as a step
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Execute on `worker` and report the outcome. Never panics on step
    /// failure; failures are data.
    async fn execute(&self, worker: &mut WorkerHandle, ctx: &StepContext<'_>) -> StepOutcome;
}

#[async_trait::async_trait]
impl Runner for ScriptStep {
    async fn execute(&self, worker: &mut WorkerHandle, ctx: &StepContext<'_>) -> StepOutcome {
        let working_dir = match &self.working_directory {
            Some(dir) => resolve_dir(&worker.checkout_dir, &ctx.substitute(dir)),
            None => worker.checkout_dir.clone(),
        };
        if !working_dir.is_dir() {
            return StepOutcome::failure_message(format!(
                "working directory '{}' does not exist",
                working_dir.display()
            ));
        }

        let script = ctx.substitute(&self.body);
        ctx.run_script(&self.interpreter, &script, ctx.env, &working_dir, worker)
            .await
            .into_outcome()
    }
}

#[async_trait::async_trait]
impl Runner for ActionStep {
    async fn execute(&self, worker: &mut WorkerHandle, ctx: &StepContext<'_>) -> StepOutcome {
        let Some(handler) = ctx.actions.resolve(&self.name) else {
            return StepOutcome::failure_message(format!("unknown action '{}'", self.name));
        };

        let params: ActionParams = self
            .params
            .iter()
            .map(|(key, value)| (key.clone(), ctx.substitute(value)))
            .collect();
        if let Err(e) = handler.validate(&params) {
            return StepOutcome::failure_message(format!("{}: {}", self.name, e));
        }

        handler.run(&params, worker, ctx).await
    }
}

#[async_trait::async_trait]
impl Runner for Step {
    async fn execute(&self, worker: &mut WorkerHandle, ctx: &StepContext<'_>) -> StepOutcome {
        match &self.kind {
            StepKind::Script(script) => script.execute(worker, ctx).await,
            StepKind::NamedAction(action) => action.execute(worker, ctx).await,
        }
    }
}

/// Relative paths resolve against `base`
pub fn resolve_dir(base: &Path, dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DEFAULT_OUTPUT_LIMIT;
    use crate::execution::matrix::{MatrixBuilder, MatrixExpander};
    use crate::spec::models::RunSpec;
    use crate::spec::trigger::TriggerEvent;

    use std::sync::Arc;
    use uuid::Uuid;

    pub(crate) fn runtime() -> RuntimeContext {
        let axes = MatrixBuilder::new().axis("os", ["linux"]).build();
        let instance = MatrixExpander::expand_all("build", &axes).unwrap().remove(0);
        let spec = RunSpec::new("build").with_env("GREETING", "hello");
        RuntimeContext::new(Uuid::new_v4(), &spec, Arc::new(TriggerEvent::manual()), instance)
    }

    pub(crate) fn context<'a>(
        runtime: &'a RuntimeContext,
        env: &'a HashMap<String, String>,
        shell: &'a ShellRunner,
        actions: &'a ActionRegistry,
        cancel: &'a CancelSignal,
    ) -> StepContext<'a> {
        StepContext {
            runtime,
            step_index: 0,
            env,
            shell,
            actions,
            timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            cancel,
            on_output: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_step_substitutes_and_runs() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        let mut worker = WorkerHandle::detached(1, temp.path(), temp.path());
        let runtime = runtime();
        let env = runtime.step_env(&worker, &Step::script("true"));
        let (shell, actions, cancel) = (ShellRunner::new(), ActionRegistry::default(), CancelSignal::never());
        let ctx = context(&runtime, &env, &shell, &actions, &cancel);

        let step = ScriptStep {
            interpreter: Shell::Sh,
            body: "echo ${{ matrix.os }} $GREETING; basename $(pwd)".to_string(),
            working_directory: Some("sub".to_string()),
        };
        let outcome = step.execute(&mut worker, &ctx).await;

        assert!(outcome.is_success());
        let stdout = &outcome.captured_output().unwrap().stdout;
        assert!(stdout.contains("linux hello"));
        assert!(stdout.ends_with("sub"));
    }

    #[tokio::test]
    async fn test_missing_working_directory_fails() {
        let temp = tempfile::tempdir().unwrap();
        let mut worker = WorkerHandle::detached(1, temp.path(), temp.path());
        let runtime = runtime();
        let env = HashMap::new();
        let (shell, actions, cancel) = (ShellRunner::new(), ActionRegistry::default(), CancelSignal::never());
        let ctx = context(&runtime, &env, &shell, &actions, &cancel);

        let step = ScriptStep {
            interpreter: Shell::Default,
            body: "echo hi".to_string(),
            working_directory: Some("nope".to_string()),
        };
        let outcome = step.execute(&mut worker, &ctx).await;
        assert!(outcome.is_failure());
        assert_eq!(outcome.exit_code(), None);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_step() {
        let temp = tempfile::tempdir().unwrap();
        let mut worker = WorkerHandle::detached(1, temp.path(), temp.path());
        let runtime = runtime();
        let env = HashMap::new();
        let (shell, actions, cancel) = (ShellRunner::new(), ActionRegistry::new(), CancelSignal::never());
        let ctx = context(&runtime, &env, &shell, &actions, &cancel);

        let outcome = Step::action("acme/rocket@v1").execute(&mut worker, &ctx).await;
        assert!(outcome.is_failure());
        assert!(outcome
            .captured_output()
            .unwrap()
            .stderr
            .contains("unknown action 'acme/rocket'"));
    }

    #[test]
    fn test_resolve_dir() {
        let base = Path::new("/repo");
        assert_eq!(resolve_dir(base, "src"), PathBuf::from("/repo/src"));
        assert_eq!(resolve_dir(base, "/tmp"), PathBuf::from("/tmp"));
    }
}
