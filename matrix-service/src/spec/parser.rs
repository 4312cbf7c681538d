// RunSpec Parser
// Parses RunSpec YAML documents and validates them before anything runs

use crate::error::{ServiceError, ServiceResult};
use crate::execution::context::{references, Reference};
use crate::execution::matrix::validate_axes;
use crate::runners::action::ActionRegistry;
use crate::runners::shell::Shell;
use crate::spec::models::{
    ActionStep, RunSpec, RunSpecDocument, ScriptStep, Step, StepDocument, StepKind,
    TriggerConfig,
};
use crate::spec::trigger::TriggerKind;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Parser for RunSpec YAML files.
pub struct RunSpecParser;

impl RunSpecParser {
    /// Parse and validate a RunSpec from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P, actions: &ActionRegistry) -> ServiceResult<RunSpec> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, actions)
    }

    /// Parse and validate a RunSpec from a YAML string.
    pub fn parse(content: &str, actions: &ActionRegistry) -> ServiceResult<RunSpec> {
        let document = Self::parse_document(content)?;
        let spec = Self::into_spec(document)?;
        Self::validate(&spec, actions)?;
        Ok(spec)
    }

    /// Parse the raw document without any semantic checks.
    pub fn parse_document(content: &str) -> ServiceResult<RunSpecDocument> {
        let document: RunSpecDocument = serde_yaml::from_str(content)?;
        Ok(document)
    }

    /// Convert a raw document into a RunSpec.
    ///
    /// Structural problems (a step with both `run` and `uses`, an unknown
    /// shell, no supported trigger) are reported here; cross-references are
    /// checked by [`RunSpecParser::validate`].
    pub fn into_spec(document: RunSpecDocument) -> ServiceResult<RunSpec> {
        let name = document.name.unwrap_or_else(|| "run".to_string());
        let triggers = convert_triggers(&document.on)?;

        let steps = document
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| convert_step(index, step))
            .collect::<ServiceResult<Vec<_>>>()?;

        Ok(RunSpec {
            name,
            triggers,
            axes: document.matrix.axes,
            env: document.env,
            provision: document.provision.unwrap_or_default(),
            steps,
        })
    }

    /// Validate a RunSpec for semantic correctness.
    pub fn validate(spec: &RunSpec, actions: &ActionRegistry) -> ServiceResult<()> {
        if spec.triggers.is_empty() {
            return Err(ServiceError::configuration(
                "RunSpec declares no supported trigger (expected workflow_dispatch or repository_dispatch)",
            ));
        }

        validate_axes(&spec.axes)?;

        if spec.steps.is_empty() {
            return Err(ServiceError::configuration(format!(
                "RunSpec '{}' has no steps",
                spec.name
            )));
        }

        let axis_names: HashSet<&str> = spec.axes.iter().map(|a| a.name.as_str()).collect();

        for (key, value) in &spec.env {
            check_references(value, &axis_names, &format!("env '{}'", key), false)?;
        }

        for (index, step) in spec.steps.iter().enumerate() {
            let label = format!("step {} '{}'", index, step.display_name());

            for (key, value) in &step.env {
                check_references(value, &axis_names, &format!("{} env '{}'", label, key), false)?;
            }

            match &step.kind {
                StepKind::NamedAction(action) => {
                    let Some(handler) = actions.resolve(&action.name) else {
                        return Err(ServiceError::configuration(format!(
                            "{} uses unknown action '{}'",
                            label, action.name
                        )));
                    };
                    handler
                        .validate(&action.params)
                        .map_err(|e| ServiceError::configuration(format!("{}: {}", label, e)))?;
                    for (key, value) in &action.params {
                        check_references(value, &axis_names, &format!("{} param '{}'", label, key), false)?;
                    }
                }
                StepKind::Script(script) => {
                    if script.body.trim().is_empty() {
                        return Err(ServiceError::configuration(format!(
                            "{} has an empty script",
                            label
                        )));
                    }
                    check_references(&script.body, &axis_names, &label, false)?;
                }
            }
        }

        if let Some(runtime) = &spec.provision.runtime {
            if !axis_names.contains(runtime.axis.as_str()) {
                return Err(ServiceError::configuration(format!(
                    "provision runtime axis '{}' is not a matrix axis",
                    runtime.axis
                )));
            }
            if let Some(install) = &runtime.install {
                check_references(install, &axis_names, "provision runtime install", true)?;
            }
            for (key, value) in &runtime.env {
                check_references(value, &axis_names, &format!("provision runtime env '{}'", key), true)?;
            }
        }

        let mut service_names = HashSet::new();
        for service in &spec.provision.services {
            if service.name.trim().is_empty() {
                return Err(ServiceError::configuration("provision service has an empty name"));
            }
            if !service_names.insert(service.name.as_str()) {
                return Err(ServiceError::configuration(format!(
                    "provision service '{}' is declared twice",
                    service.name
                )));
            }
            if service.start.trim().is_empty() {
                return Err(ServiceError::configuration(format!(
                    "provision service '{}' has an empty start command",
                    service.name
                )));
            }
        }

        Ok(())
    }
}

fn convert_triggers(config: &TriggerConfig) -> ServiceResult<Vec<TriggerKind>> {
    let declared: Vec<(String, Vec<String>)> = match config {
        TriggerConfig::Single(name) => vec![(name.clone(), Vec::new())],
        TriggerConfig::Multiple(names) => names.iter().map(|n| (n.clone(), Vec::new())).collect(),
        TriggerConfig::Detailed(events) => events
            .iter()
            .map(|(name, config)| {
                let types = config.as_ref().map(|c| c.types.clone()).unwrap_or_default();
                (name.clone(), types)
            })
            .collect(),
    };

    let mut kinds = Vec::new();
    for (name, types) in declared {
        match TriggerKind::from_name(&name, types) {
            Some(kind) => {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
            None => {
                tracing::warn!(trigger = %name, "ignoring unsupported trigger kind");
            }
        }
    }

    if kinds.is_empty() {
        return Err(ServiceError::configuration(
            "RunSpec declares no supported trigger (expected workflow_dispatch or repository_dispatch)",
        ));
    }

    Ok(kinds)
}

fn convert_step(index: usize, step: StepDocument) -> ServiceResult<Step> {
    let label = step.name.clone().unwrap_or_else(|| "unnamed".to_string());

    let kind = match (step.run, step.uses) {
        (Some(_), Some(_)) => {
            return Err(ServiceError::configuration(format!(
                "step {} '{}' cannot have both 'run' and 'uses'",
                index, label
            )));
        }
        (None, None) => {
            return Err(ServiceError::configuration(format!(
                "step {} '{}' must have either 'run' or 'uses'",
                index, label
            )));
        }
        (Some(body), None) => {
            let interpreter = match step.shell.as_deref() {
                Some(shell) => shell.parse::<Shell>().map_err(|e| {
                    ServiceError::configuration(format!("step {} '{}': {}", index, label, e))
                })?,
                None => Shell::Default,
            };
            StepKind::Script(ScriptStep {
                interpreter,
                body,
                working_directory: step.working_directory,
            })
        }
        (None, Some(reference)) => {
            if step.shell.is_some() {
                return Err(ServiceError::configuration(format!(
                    "step {} '{}' sets 'shell' on an action step",
                    index, label
                )));
            }
            let mut action = ActionStep::parse(&reference);
            if action.name.is_empty() {
                return Err(ServiceError::configuration(format!(
                    "step {} '{}' has an empty action reference",
                    index, label
                )));
            }
            action.params = step.with;
            StepKind::NamedAction(action)
        }
    };

    Ok(Step {
        name: step.name,
        kind,
        env: step.env,
        continue_on_error: step.continue_on_error,
        timeout: step.timeout_minutes.map(|m| Duration::from_secs(m.saturating_mul(60))),
    })
}

/// Reject `${{ }}` references that can never resolve.
///
/// `allow_version` admits the bare `${{ version }}` used by provisioning.
fn check_references(
    template: &str,
    axes: &HashSet<&str>,
    location: &str,
    allow_version: bool,
) -> ServiceResult<()> {
    for reference in references(template) {
        match reference {
            Reference::Matrix(axis) if !axes.contains(axis.as_str()) => {
                return Err(ServiceError::configuration(format!(
                    "{} references unknown matrix axis '{}'",
                    location, axis
                )));
            }
            Reference::Version if !allow_version => {
                return Err(ServiceError::configuration(format!(
                    "{} uses '${{{{ version }}}}' outside of provisioning",
                    location
                )));
            }
            Reference::Unknown(expr) => {
                return Err(ServiceError::configuration(format!(
                    "{} has an unsupported expression '{}'",
                    location, expr
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBSERVED: &str = r#"
name: integration
on:
  workflow_dispatch:
  repository_dispatch:
env:
  PYTHONUNBUFFERED: "1"
matrix:
  python-version: ["3.9.x", "3.10.x", "3.11.x", "3.12.x", "3.13.x"]
  os: [macos-latest]
steps:
  - uses: actions/checkout@v4
  - uses: actions/setup-python@v5
    with:
      python-version: ${{ matrix.python-version }}
  - name: Install dependencies
    run: |
      python -m pip install --upgrade pip
      pip install -e .
  - name: Run integration tests
    shell: bash
    run: ./tests/integration-tests.sh
    env:
      SKIP_FASTEMBED: "1"
"#;

    #[test]
    fn test_parse_observed_configuration() {
        let spec = RunSpecParser::parse(OBSERVED, &ActionRegistry::default()).unwrap();

        assert_eq!(spec.name, "integration");
        assert_eq!(spec.triggers.len(), 2);
        assert_eq!(spec.axes.len(), 2);
        assert_eq!(spec.steps.len(), 4);
        assert!(matches!(spec.steps[0].kind, StepKind::NamedAction(_)));

        match &spec.steps[3].kind {
            StepKind::Script(script) => assert_eq!(script.interpreter, Shell::Bash),
            other => panic!("expected script step, got {:?}", other),
        }
        assert_eq!(spec.steps[3].env.get("SKIP_FASTEMBED"), Some(&"1".to_string()));
    }

    #[test]
    fn test_unknown_action_is_configuration_error() {
        let yaml = r#"
on: workflow_dispatch
steps:
  - uses: acme/deploy-rocket@v1
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("unknown action 'acme/deploy-rocket'"));
    }

    #[test]
    fn test_empty_axis_is_configuration_error() {
        let yaml = r#"
on: workflow_dispatch
matrix:
  python-version: []
steps:
  - run: echo hi
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("has no values"));
    }

    #[test]
    fn test_step_with_both_run_and_uses() {
        let yaml = r#"
on: workflow_dispatch
steps:
  - run: echo hi
    uses: actions/checkout@v4
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("cannot have both 'run' and 'uses'"));
    }

    #[test]
    fn test_step_without_run_or_uses() {
        let yaml = r#"
on: workflow_dispatch
steps:
  - name: nothing
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("must have either 'run' or 'uses'"));
    }

    #[test]
    fn test_unsupported_triggers_only() {
        let yaml = r#"
on: [push, pull_request]
steps:
  - run: echo hi
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("no supported trigger"));
    }

    #[test]
    fn test_unsupported_triggers_are_ignored_alongside_supported() {
        let yaml = r#"
on: [push, workflow_dispatch]
steps:
  - run: echo hi
"#;
        let spec = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap();
        assert_eq!(spec.triggers, vec![TriggerKind::Manual]);
    }

    #[test]
    fn test_unknown_matrix_reference() {
        let yaml = r#"
on: workflow_dispatch
matrix:
  os: [linux]
steps:
  - run: echo ${{ matrix.python-version }}
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("unknown matrix axis 'python-version'"));
    }

    #[test]
    fn test_unknown_shell() {
        let yaml = r#"
on: workflow_dispatch
steps:
  - run: echo hi
    shell: fish-and-chips
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_runtime_axis_must_exist() {
        let yaml = r#"
on: workflow_dispatch
matrix:
  os: [linux]
provision:
  runtime:
    axis: python-version
steps:
  - run: echo hi
"#;
        let err = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("provision runtime axis"));
    }

    #[test]
    fn test_timeout_minutes() {
        let yaml = r#"
on: workflow_dispatch
steps:
  - run: sleep 1
    timeout-minutes: 2
"#;
        let spec = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap();
        assert_eq!(spec.steps[0].timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_huge_timeout_minutes_saturates() {
        let yaml = r#"
on: workflow_dispatch
steps:
  - run: sleep 1
    timeout-minutes: 18446744073709551615
"#;
        let spec = RunSpecParser::parse(yaml, &ActionRegistry::default()).unwrap();
        assert_eq!(spec.steps[0].timeout, Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = RunSpecParser::parse("on: [unclosed", &ActionRegistry::default()).unwrap_err();
        assert!(matches!(err, ServiceError::Yaml(_)));
    }
}
