// Trigger Events
// Events that may start a run, and the trigger kinds a RunSpec declares

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An event delivered by the invoking platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Manual invocation, optionally with named inputs
    ManualDispatch {
        #[serde(default)]
        inputs: IndexMap<String, String>,
    },

    /// External event dispatch; the payload is passed to steps unmodified
    ExternalDispatch {
        #[serde(default)]
        event_type: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl TriggerEvent {
    pub fn manual() -> Self {
        Self::ManualDispatch {
            inputs: IndexMap::new(),
        }
    }

    pub fn external(event_type: Option<String>, payload: serde_json::Value) -> Self {
        Self::ExternalDispatch {
            event_type,
            payload,
        }
    }

    /// Short event name exported to steps as `CI_EVENT_NAME`
    pub fn name(&self) -> &'static str {
        match self {
            Self::ManualDispatch { .. } => "manual",
            Self::ExternalDispatch { .. } => "external",
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::ExternalDispatch { event_type, .. } => event_type.as_deref(),
            Self::ManualDispatch { .. } => None,
        }
    }

    pub fn inputs(&self) -> Option<&IndexMap<String, String>> {
        match self {
            Self::ManualDispatch { inputs } => Some(inputs),
            Self::ExternalDispatch { .. } => None,
        }
    }

    /// The external payload rendered as JSON text (`null` for manual runs)
    pub fn payload_json(&self) -> String {
        match self {
            Self::ExternalDispatch { payload, .. } => payload.to_string(),
            Self::ManualDispatch { .. } => "null".to_string(),
        }
    }
}

/// A trigger kind declared in a RunSpec's `on:` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    Manual,
    /// External dispatch, restricted to `types` when non-empty
    External { types: Vec<String> },
}

impl TriggerKind {
    /// Map a trigger name from the document onto a kind
    pub fn from_name(name: &str, types: Vec<String>) -> Option<Self> {
        match name {
            "workflow_dispatch" | "manual" => Some(Self::Manual),
            "repository_dispatch" | "external" => Some(Self::External { types }),
            _ => None,
        }
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match (self, event) {
            (Self::Manual, TriggerEvent::ManualDispatch { .. }) => true,
            (Self::External { types }, TriggerEvent::ExternalDispatch { event_type, .. }) => {
                types.is_empty()
                    || event_type
                        .as_deref()
                        .map(|t| types.iter().any(|allowed| allowed == t))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matching() {
        let manual = TriggerKind::Manual;
        let external = TriggerKind::External { types: vec![] };

        assert!(manual.matches(&TriggerEvent::manual()));
        assert!(!manual.matches(&TriggerEvent::external(None, serde_json::Value::Null)));
        assert!(external.matches(&TriggerEvent::external(None, serde_json::Value::Null)));
        assert!(!external.matches(&TriggerEvent::manual()));
    }

    #[test]
    fn test_external_type_filter() {
        let kind = TriggerKind::External {
            types: vec!["nightly".to_string()],
        };
        let nightly = TriggerEvent::external(Some("nightly".into()), serde_json::json!({}));
        let other = TriggerEvent::external(Some("release".into()), serde_json::json!({}));
        let untyped = TriggerEvent::external(None, serde_json::json!({}));

        assert!(kind.matches(&nightly));
        assert!(!kind.matches(&other));
        assert!(!kind.matches(&untyped));
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(
            TriggerKind::from_name("workflow_dispatch", vec![]),
            Some(TriggerKind::Manual)
        );
        assert_eq!(
            TriggerKind::from_name("external", vec![]),
            Some(TriggerKind::External { types: vec![] })
        );
        assert_eq!(TriggerKind::from_name("push", vec![]), None);
    }

    #[test]
    fn test_payload_passthrough() {
        let payload = serde_json::json!({"ref": "main", "suite": ["a", "b"]});
        let event = TriggerEvent::external(Some("ci".into()), payload.clone());
        let parsed: serde_json::Value = serde_json::from_str(&event.payload_json()).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(TriggerEvent::manual().payload_json(), "null");
    }

    #[test]
    fn test_event_serialization() {
        let event = TriggerEvent::external(Some("ci".into()), serde_json::json!({"a": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "external_dispatch");
        assert_eq!(json["event_type"], "ci");
    }
}
