// RunSpec Models
// The YAML document shape and the validated, immutable RunSpec built from it

use crate::runners::shell::Shell;
use crate::spec::trigger::{TriggerEvent, TriggerKind};

use indexmap::IndexMap;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt;
use std::time::Duration;

/// A run specification document as written in YAML.
///
/// This is the raw, unvalidated form. Use
/// [`RunSpecParser`](crate::spec::RunSpecParser) to turn it into a [`RunSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpecDocument {
    /// Name of the run (used in job display names)
    #[serde(default)]
    pub name: Option<String>,

    /// Trigger kinds that may start a run
    #[serde(rename = "on")]
    pub on: TriggerConfig,

    /// Global environment variables, constant across the run
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Matrix axes in declaration order
    #[serde(default)]
    pub matrix: MatrixBlock,

    /// Host provisioning performed before any step runs
    #[serde(default)]
    pub provision: Option<ProvisionConfig>,

    /// Ordered steps shared by every job instance
    #[serde(default)]
    pub steps: Vec<StepDocument>,
}

/// Trigger declaration.
///
/// Supports `on: workflow_dispatch`, `on: [workflow_dispatch, repository_dispatch]`
/// and the detailed mapping form with per-event configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerConfig {
    Single(String),
    Multiple(Vec<String>),
    Detailed(IndexMap<String, Option<EventConfig>>),
}

/// Per-trigger configuration in the detailed `on:` form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    /// Accepted external event types (empty = any)
    #[serde(default)]
    pub types: Vec<String>,
}

/// One named matrix dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// The `matrix:` block.
///
/// Deserialized by hand so that declaration order is kept and repeated axis
/// names survive until validation can report them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixBlock {
    pub axes: Vec<MatrixAxis>,
}

impl Serialize for MatrixBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.axes.len()))?;
        for axis in &self.axes {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = MatrixBlock;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of axis names to lists of values")
            }

            fn visit_unit<E>(self) -> Result<MatrixBlock, E> {
                Ok(MatrixBlock::default())
            }

            fn visit_none<E>(self) -> Result<MatrixBlock, E> {
                Ok(MatrixBlock::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<MatrixBlock, A::Error> {
                let mut axes = Vec::new();
                while let Some((name, values)) = map.next_entry::<String, Vec<String>>()? {
                    axes.push(MatrixAxis { name, values });
                }
                Ok(MatrixBlock { axes })
            }
        }

        deserializer.deserialize_any(MatrixVisitor)
    }
}

/// The `provision:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Language runtime selected per job instance
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,

    /// Auxiliary services (e.g. a container daemon) started before steps
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Retries after the first failed attempt (overrides the engine default)
    #[serde(default, rename = "max-retries")]
    pub max_retries: Option<u32>,
}

impl ProvisionConfig {
    pub fn is_empty(&self) -> bool {
        self.runtime.is_none() && self.services.is_empty()
    }
}

/// Runtime selection for a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Matrix axis holding the runtime version descriptor
    pub axis: String,

    /// Command installing or selecting the runtime (`${{ version }}` is substituted)
    #[serde(default)]
    pub install: Option<String>,

    /// Extra environment exported once the runtime is ready
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

/// An auxiliary service managed by shell commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Command bringing the service up
    pub start: String,

    /// Readiness check run after `start`
    #[serde(default)]
    pub check: Option<String>,

    /// Command run when the worker is torn down
    #[serde(default)]
    pub stop: Option<String>,
}

/// A step as written in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDocument {
    #[serde(default)]
    pub name: Option<String>,

    /// Named action, `name@version`
    #[serde(default)]
    pub uses: Option<String>,

    /// Parameters for the named action
    #[serde(default)]
    pub with: IndexMap<String, String>,

    /// Inline script
    #[serde(default)]
    pub run: Option<String>,

    /// Interpreter for `run`
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Environment overlay for this step
    #[serde(default)]
    pub env: IndexMap<String, String>,

    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,
}

/// A validated run specification. Immutable once a run starts.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub triggers: Vec<TriggerKind>,
    pub axes: Vec<MatrixAxis>,
    pub env: IndexMap<String, String>,
    pub provision: ProvisionConfig,
    pub steps: Vec<Step>,
}

impl RunSpec {
    /// Create a manually-triggered spec with no axes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: vec![TriggerKind::Manual],
            axes: Vec::new(),
            env: IndexMap::new(),
            provision: ProvisionConfig::default(),
            steps: Vec::new(),
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<TriggerKind>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_axis(mut self, axis: MatrixAxis) -> Self {
        self.axes.push(axis);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_provision(mut self, provision: ProvisionConfig) -> Self {
        self.provision = provision;
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Whether an incoming event may start a run of this spec
    pub fn accepts(&self, event: &TriggerEvent) -> bool {
        self.triggers.iter().any(|kind| kind.matches(event))
    }
}

/// One unit of work within a job instance
#[derive(Debug, Clone)]
pub struct Step {
    pub name: Option<String>,
    pub kind: StepKind,
    /// Environment overlay, wins over every other source
    pub env: IndexMap<String, String>,
    /// Optional steps may fail without failing the job
    pub continue_on_error: bool,
    pub timeout: Option<Duration>,
}

/// The two flavours of step
#[derive(Debug, Clone)]
pub enum StepKind {
    NamedAction(ActionStep),
    Script(ScriptStep),
}

/// Invocation of a registered named action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionStep {
    pub name: String,
    pub version: Option<String>,
    pub params: IndexMap<String, String>,
}

impl ActionStep {
    /// Parse a `uses:` reference such as `actions/checkout@v4`
    pub fn parse(reference: &str) -> Self {
        let (name, version) = match reference.rsplit_once('@') {
            Some((name, version)) if !version.is_empty() => {
                (name.to_string(), Some(version.to_string()))
            }
            _ => (reference.trim_end_matches('@').to_string(), None),
        };
        Self {
            name,
            version,
            params: IndexMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Literal script run under an interpreter
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub interpreter: Shell,
    pub body: String,
    /// Relative paths resolve against the worker's checkout root
    pub working_directory: Option<String>,
}

impl Step {
    /// Script step using the default shell
    pub fn script(body: impl Into<String>) -> Self {
        Self::from_kind(StepKind::Script(ScriptStep {
            interpreter: Shell::Default,
            body: body.into(),
            working_directory: None,
        }))
    }

    /// Named action step from a `name@version` reference
    pub fn action(reference: &str) -> Self {
        Self::from_kind(StepKind::NamedAction(ActionStep::parse(reference)))
    }

    pub fn from_kind(kind: StepKind) -> Self {
        Self {
            name: None,
            kind,
            env: IndexMap::new(),
            continue_on_error: false,
            timeout: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let StepKind::NamedAction(action) = &mut self.kind {
            action.params.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_interpreter(mut self, shell: Shell) -> Self {
        if let StepKind::Script(script) = &mut self.kind {
            script.interpreter = shell;
        }
        self
    }

    pub fn optional(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get a display name for the step
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            StepKind::NamedAction(action) => match &action.version {
                Some(version) => format!("Run {}@{}", action.name, version),
                None => format!("Run {}", action.name),
            },
            StepKind::Script(script) => {
                let first_line = script.body.lines().next().unwrap_or("").trim();
                if first_line.chars().count() > 50 {
                    let truncated: String = first_line.chars().take(47).collect();
                    format!("Run {}...", truncated)
                } else {
                    format!("Run {}", first_line)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matrix_block_keeps_order() {
        let yaml = r#"
name: integration
on: workflow_dispatch
matrix:
  python-version: ["3.9.x", "3.10.x", "3.11.x"]
  os: [macos-latest]
steps:
  - run: echo hi
"#;
        let doc: RunSpecDocument = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<_> = doc.matrix.axes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["python-version", "os"]);
        assert_eq!(doc.matrix.axes[0].values, vec!["3.9.x", "3.10.x", "3.11.x"]);
    }

    #[test]
    fn test_parse_matrix_numbers_as_strings() {
        let yaml = r#"
on: workflow_dispatch
matrix:
  node: [18, 20]
steps:
  - run: echo hi
"#;
        let doc: RunSpecDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.matrix.axes[0].values, vec!["18", "20"]);
    }

    #[test]
    fn test_parse_triggers() {
        let single: RunSpecDocument =
            serde_yaml::from_str("on: workflow_dispatch\nsteps: []\n").unwrap();
        assert!(matches!(single.on, TriggerConfig::Single(ref s) if s == "workflow_dispatch"));

        let multiple: RunSpecDocument =
            serde_yaml::from_str("on: [workflow_dispatch, repository_dispatch]\n").unwrap();
        assert!(matches!(multiple.on, TriggerConfig::Multiple(ref v) if v.len() == 2));

        let detailed: RunSpecDocument = serde_yaml::from_str(
            "on:\n  workflow_dispatch:\n  repository_dispatch:\n    types: [nightly]\n",
        )
        .unwrap();
        match detailed.on {
            TriggerConfig::Detailed(events) => {
                assert!(events["workflow_dispatch"].is_none());
                assert_eq!(
                    events["repository_dispatch"].as_ref().unwrap().types,
                    vec!["nightly"]
                );
            }
            other => panic!("expected detailed triggers, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_provision_block() {
        let yaml = r#"
on: workflow_dispatch
provision:
  runtime:
    axis: python-version
    install: "uv python install ${{ version }}"
  services:
    - name: docker
      start: colima start
      check: docker info
  max-retries: 2
"#;
        let doc: RunSpecDocument = serde_yaml::from_str(yaml).unwrap();
        let provision = doc.provision.unwrap();
        assert_eq!(provision.runtime.unwrap().axis, "python-version");
        assert_eq!(provision.services[0].name, "docker");
        assert_eq!(provision.services[0].stop, None);
        assert_eq!(provision.max_retries, Some(2));
    }

    #[test]
    fn test_action_reference_parsing() {
        let action = ActionStep::parse("actions/setup-python@v5");
        assert_eq!(action.name, "actions/setup-python");
        assert_eq!(action.version.as_deref(), Some("v5"));

        let action = ActionStep::parse("checkout");
        assert_eq!(action.name, "checkout");
        assert_eq!(action.version, None);
    }

    #[test]
    fn test_step_display_name() {
        assert_eq!(Step::script("echo hello").display_name(), "Run echo hello");
        assert_eq!(
            Step::action("actions/checkout@v4").display_name(),
            "Run actions/checkout@v4"
        );
        assert_eq!(
            Step::script("make").named("Build").display_name(),
            "Build"
        );

        let long = "x".repeat(80);
        assert!(Step::script(long).display_name().ends_with("..."));
    }

    #[test]
    fn test_matrix_block_serializes_as_mapping() {
        let block = MatrixBlock {
            axes: vec![MatrixAxis::new("os", ["linux", "macos"])],
        };
        let yaml = serde_yaml::to_string(&block).unwrap();
        assert!(yaml.contains("os:"));
        assert!(yaml.contains("- linux"));
    }
}
