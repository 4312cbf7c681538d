// Named Actions
// Registry of reusable actions invoked by `uses:` steps, plus the built-ins

use crate::execution::outcome::{CapturedOutput, StepOutcome};
use crate::runners::{Shell, StepContext};
use crate::utils::env_key;
use crate::worker::WorkerHandle;

use async_trait::async_trait;
use indexmap::IndexMap;

use std::collections::HashMap;
use std::sync::Arc;

/// Parameters passed to an action (`with:`), already substituted
pub type ActionParams = IndexMap<String, String>;

/// A reusable step implementation
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Check parameters before a run starts
    fn validate(&self, _params: &ActionParams) -> Result<(), String> {
        Ok(())
    }

    async fn run(
        &self,
        params: &ActionParams,
        worker: &mut WorkerHandle,
        ctx: &StepContext<'_>,
    ) -> StepOutcome;
}

/// Actions available to `uses:` steps
#[derive(Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Registry with `checkout`, `setup-python`, `setup-node`, `setup-go` and `export-env`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(CheckoutAction);
        registry.register(SetupRuntimeAction::new("python"));
        registry.register(SetupRuntimeAction::new("node"));
        registry.register(SetupRuntimeAction::new("go"));
        registry.register(ExportEnvAction);
        registry
    }

    pub fn register(&mut self, action: impl Action + 'static) {
        self.actions.insert(action.name().to_string(), Arc::new(action));
    }

    /// Look up an action by reference name. `actions/checkout` falls back to
    /// `checkout` when no exact match is registered.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Action>> {
        if let Some(action) = self.actions.get(name) {
            return Some(action.clone());
        }
        let short = name.rsplit('/').next()?;
        self.actions.get(short).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Confirms the repository checkout is present on the worker
pub struct CheckoutAction;

#[async_trait]
impl Action for CheckoutAction {
    fn name(&self) -> &str {
        "checkout"
    }

    async fn run(
        &self,
        params: &ActionParams,
        worker: &mut WorkerHandle,
        _ctx: &StepContext<'_>,
    ) -> StepOutcome {
        let root = match params.get("path") {
            Some(path) => super::resolve_dir(&worker.checkout_dir, path),
            None => worker.checkout_dir.clone(),
        };
        if !root.is_dir() {
            return StepOutcome::failure_message(format!(
                "checkout directory '{}' does not exist",
                root.display()
            ));
        }
        worker.export("CI_WORKSPACE", root.to_string_lossy().to_string());
        StepOutcome::success(
            None,
            CapturedOutput::new(format!("Using checkout at {}", root.display()), ""),
        )
    }
}

/// `setup-<language>`: selects a runtime version for later steps
pub struct SetupRuntimeAction {
    name: String,
    language: String,
}

impl SetupRuntimeAction {
    pub fn new(language: &str) -> Self {
        Self {
            name: format!("setup-{}", language),
            language: language.to_string(),
        }
    }

    fn version_param(&self) -> String {
        format!("{}-version", self.language)
    }

    fn version<'p>(&self, params: &'p ActionParams) -> Option<&'p str> {
        params
            .get(&self.version_param())
            .or_else(|| params.get("version"))
            .map(String::as_str)
    }
}

#[async_trait]
impl Action for SetupRuntimeAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, params: &ActionParams) -> Result<(), String> {
        match self.version(params) {
            Some(version) if !version.trim().is_empty() => Ok(()),
            Some(_) => Err(format!("'{}' is empty", self.version_param())),
            None => Err(format!("missing required parameter '{}'", self.version_param())),
        }
    }

    async fn run(
        &self,
        params: &ActionParams,
        worker: &mut WorkerHandle,
        ctx: &StepContext<'_>,
    ) -> StepOutcome {
        let Some(version) = self.version(params).map(str::trim) else {
            return StepOutcome::failure_message(format!(
                "missing required parameter '{}'",
                self.version_param()
            ));
        };

        let var = format!("{}_VERSION", env_key(&self.language));
        let mut stdout = format!("Using {} {}", self.language, version);
        if let Some(provisioned) = &worker.runtime_version {
            if provisioned != version {
                stdout.push_str(&format!(" (worker was provisioned with {})", provisioned));
            }
        }

        let Some(install) = params.get("install") else {
            worker.export(var, version);
            return StepOutcome::success(None, CapturedOutput::new(stdout, ""));
        };

        let mut env = ctx.env.clone();
        env.insert(var.clone(), version.to_string());
        let output = ctx
            .run_script(&Shell::Default, install, &env, &worker.checkout_dir, worker)
            .await;
        if output.success() {
            worker.export(var, version);
        }
        let mut outcome = output.into_outcome();
        if let Some(captured) = outcome.captured_output_mut() {
            captured.stdout = format!("{}\n{}", stdout, captured.stdout);
        }
        outcome
    }
}

/// Persists its parameters into the worker environment for later steps
pub struct ExportEnvAction;

#[async_trait]
impl Action for ExportEnvAction {
    fn name(&self) -> &str {
        "export-env"
    }

    fn validate(&self, params: &ActionParams) -> Result<(), String> {
        if params.is_empty() {
            return Err("export-env needs at least one parameter".to_string());
        }
        for key in params.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(format!("'{}' is not a valid environment variable name", key));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        params: &ActionParams,
        worker: &mut WorkerHandle,
        _ctx: &StepContext<'_>,
    ) -> StepOutcome {
        let mut exported = Vec::new();
        for (key, value) in params {
            worker.export(key.clone(), value.clone());
            exported.push(key.as_str());
        }
        StepOutcome::success(
            None,
            CapturedOutput::new(format!("Exported {}", exported.join(", ")), ""),
        )
    }
}
