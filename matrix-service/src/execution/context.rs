// Runtime Context
// Per-job environment composition and `${{ }}` substitution

use crate::execution::matrix::JobInstance;
use crate::spec::models::{RunSpec, Step};
use crate::spec::trigger::TriggerEvent;
use crate::utils::env_key;
use crate::worker::WorkerHandle;

use indexmap::IndexMap;
use uuid::Uuid;

use std::collections::HashMap;
use std::sync::Arc;

/// A `${{ ... }}` reference found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Matrix(String),
    Env(String),
    Input(String),
    EventType,
    EventPayload,
    /// Runtime version descriptor, only meaningful while provisioning
    Version,
    Unknown(String),
}

impl Reference {
    fn parse(expr: &str) -> Self {
        let expr = expr.trim();
        if expr == "version" {
            return Self::Version;
        }
        if expr == "event.type" {
            return Self::EventType;
        }
        if expr == "event.payload" {
            return Self::EventPayload;
        }
        if let Some(axis) = expr.strip_prefix("matrix.") {
            return Self::Matrix(axis.to_string());
        }
        if let Some(name) = expr.strip_prefix("env.") {
            return Self::Env(name.to_string());
        }
        if let Some(name) = expr.strip_prefix("inputs.") {
            return Self::Input(name.to_string());
        }
        Self::Unknown(expr.to_string())
    }
}

/// Walk `template`, replacing every `${{ expr }}` with `replace(expr)`.
/// An unterminated `${{` is copied through untouched.
fn rewrite(template: &str, mut replace: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                out.push_str(&replace(&after[..end]));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Every reference in a template, in order of appearance
pub fn references(template: &str) -> Vec<Reference> {
    let mut found = Vec::new();
    rewrite(template, |expr| {
        found.push(Reference::parse(expr));
        String::new()
    });
    found
}

/// Values visible to substitution
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub instance: Option<&'a JobInstance>,
    pub env: &'a HashMap<String, String>,
    pub event: Option<&'a TriggerEvent>,
    pub version: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub fn new(env: &'a HashMap<String, String>) -> Self {
        Self {
            instance: None,
            env,
            event: None,
            version: None,
        }
    }

    pub fn with_instance(mut self, instance: &'a JobInstance) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_event(mut self, event: &'a TriggerEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_version(mut self, version: Option<&'a str>) -> Self {
        self.version = version;
        self
    }

    /// Resolve a reference; anything unresolvable becomes an empty string
    pub fn resolve(&self, reference: &Reference) -> String {
        let value = match reference {
            Reference::Matrix(axis) => self
                .instance
                .and_then(|i| i.value(axis))
                .map(str::to_string),
            Reference::Env(name) => self.env.get(name).cloned(),
            Reference::Input(name) => self
                .event
                .and_then(|e| e.inputs())
                .and_then(|inputs| inputs.get(name))
                .cloned(),
            Reference::EventType => self.event.and_then(|e| e.event_type()).map(str::to_string),
            Reference::EventPayload => self.event.map(|e| e.payload_json()),
            Reference::Version => self.version.map(str::to_string),
            Reference::Unknown(_) => None,
        };
        value.unwrap_or_default()
    }

    pub fn substitute(&self, template: &str) -> String {
        rewrite(template, |expr| self.resolve(&Reference::parse(expr)))
    }
}

/// Everything a job instance knows about the run it belongs to
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub run_id: Uuid,
    pub run_name: String,
    pub event: Arc<TriggerEvent>,
    pub instance: JobInstance,
    pub global_env: IndexMap<String, String>,
}

impl RuntimeContext {
    pub fn new(run_id: Uuid, spec: &RunSpec, event: Arc<TriggerEvent>, instance: JobInstance) -> Self {
        Self {
            run_id,
            run_name: spec.name.clone(),
            event,
            instance,
            global_env: spec.env.clone(),
        }
    }

    pub fn scope<'a>(&'a self, env: &'a HashMap<String, String>) -> Scope<'a> {
        Scope::new(env)
            .with_instance(&self.instance)
            .with_event(&self.event)
    }

    /// Run-level environment: CI variables, matrix values, inputs, then the
    /// global mapping (which may reference the earlier entries).
    pub fn base_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("CI_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("CI_RUN_NAME".to_string(), self.run_name.clone());
        env.insert("CI_JOB_NAME".to_string(), self.instance.name.clone());
        env.insert("CI_JOB_INDEX".to_string(), self.instance.index.to_string());
        env.insert("CI_EVENT_NAME".to_string(), self.event.name().to_string());
        env.insert("CI_EVENT_PAYLOAD".to_string(), self.event.payload_json());
        if let Some(event_type) = self.event.event_type() {
            env.insert("CI_EVENT_TYPE".to_string(), event_type.to_string());
        }
        if let Some(inputs) = self.event.inputs() {
            for (name, value) in inputs {
                env.insert(format!("INPUT_{}", env_key(name)), value.clone());
            }
        }
        env.extend(self.instance.env_vars());

        for (key, template) in &self.global_env {
            let value = self.scope(&env).substitute(template);
            env.insert(key.clone(), value);
        }
        env
    }

    /// Base environment plus whatever provisioning and earlier steps exported
    pub fn worker_env(&self, worker: &WorkerHandle) -> HashMap<String, String> {
        let mut env = self.base_env();
        env.insert("CI_WORKER_ID".to_string(), worker.id.to_string());
        env.insert(
            "RUNNER_TEMP".to_string(),
            worker.scratch_dir.to_string_lossy().to_string(),
        );
        env.extend(worker.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Full environment for one step; the step overlay wins
    pub fn step_env(&self, worker: &WorkerHandle, step: &Step) -> HashMap<String, String> {
        let mut env = self.worker_env(worker);
        let overlay: Vec<(String, String)> = step
            .env
            .iter()
            .map(|(key, template)| (key.clone(), self.scope(&env).substitute(template)))
            .collect();
        env.extend(overlay);
        env
    }
}
