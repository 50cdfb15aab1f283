//! Shared status types used by the work CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Applied, Available)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(
        rename = "observedGeneration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Attach the observed generation
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Whether this condition is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or replace a condition of the same type.
///
/// The transition time is kept when the status did not change so that
/// repeated status syncs do not churn the object.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Group/resource/namespace/name of an object on the spoke cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    /// API group ("" for the core group)
    #[serde(default)]
    pub group: String,
    /// Plural resource name (e.g. "configmaps")
    pub resource: String,
    /// Namespace ("" for cluster-scoped resources)
    #[serde(default)]
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl std::fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", group, self.resource, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                group, self.resource, self.namespace, self.name
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_appends_new_types() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new("Applied", ConditionStatus::True, "AppliedManifestComplete", ""),
        );
        set_condition(
            &mut conditions,
            Condition::new("Available", ConditionStatus::False, "ResourceMissing", ""),
        );
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "Applied").is_some_and(Condition::is_true));
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_is_unchanged() {
        let mut first = Condition::new("Available", ConditionStatus::True, "Ok", "");
        first.last_transition_time = Utc::now() - chrono::Duration::hours(1);
        let original = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::new("Available", ConditionStatus::True, "Ok", "still fine"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original);
        assert_eq!(conditions[0].message, "still fine");

        set_condition(
            &mut conditions,
            Condition::new("Available", ConditionStatus::False, "Missing", ""),
        );
        assert!(conditions[0].last_transition_time > original);
    }

    #[test]
    fn condition_deserializes_without_optional_fields() {
        let json = r#"{"type":"Applied","status":"True","lastTransitionTime":"2024-01-01T00:00:00Z"}"#;
        let condition: Condition = serde_json::from_str(json).unwrap();
        assert!(condition.is_true());
        assert!(condition.reason.is_empty());
        assert_eq!(condition.observed_generation, None);
    }

    #[test]
    fn resource_identifier_display() {
        let namespaced = ResourceIdentifier {
            group: String::new(),
            resource: "configmaps".to_string(),
            namespace: "default".to_string(),
            name: "cm1".to_string(),
        };
        assert_eq!(namespaced.to_string(), "core/configmaps default/cm1");

        let cluster_scoped = ResourceIdentifier {
            group: "rbac.authorization.k8s.io".to_string(),
            resource: "clusterroles".to_string(),
            namespace: String::new(),
            name: "viewer".to_string(),
        };
        assert_eq!(
            cluster_scoped.to_string(),
            "rbac.authorization.k8s.io/clusterroles viewer"
        );
    }
}
