//! Status sub-resource of the `Atom` owner.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set on every pass.
pub const CONDITION_RECONCILED: &str = "Reconciled";
pub const REASON_SUCCEEDED: &str = "Succeeded";
pub const REASON_ERROR: &str = "Error";

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AtomStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// `<Kind>/<name>` -> outcome of the latest pass.
    #[serde(default)]
    pub operation_results: BTreeMap<String, OperationResult>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// RFC 3339, UTC, seconds precision.
    pub last_transition_time: String,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
    Error,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
            OperationResult::Error => "error",
        };
        f.write_str(s)
    }
}

impl AtomStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_wire_names() {
        let mut st = AtomStatus::default();
        st.conditions.push(Condition {
            type_: CONDITION_RECONCILED.into(),
            status: ConditionStatus::True,
            reason: REASON_SUCCEEDED.into(),
            message: String::new(),
            observed_generation: Some(3),
            last_transition_time: "2024-01-01T00:00:00Z".into(),
        });
        st.operation_results.insert("Service/a-atom".into(), OperationResult::Unchanged);
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["conditions"][0]["type"], "Reconciled");
        assert_eq!(v["conditions"][0]["status"], "True");
        assert_eq!(v["conditions"][0]["observedGeneration"], 3);
        assert_eq!(v["operationResults"]["Service/a-atom"], "unchanged");
    }
}
