use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// Template: `spec.defaultVersionId` names a sequenced version it owns.
    DefaultVersionValid,
    /// TemplateVersion: a version number has been assigned.
    Sequenced,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: Option<String>,
        now: String,
    ) -> Self {
        Self {
            type_,
            status,
            reason: Some(reason.to_string()),
            message,
            last_transition_time: Some(now),
        }
    }

    /// Equal apart from the transition timestamp.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Upsert `incoming` by type, keeping the previous transition time when the
/// condition did not actually change.
pub fn upsert_condition(
    existing: Option<&Vec<Condition>>,
    incoming: Condition,
) -> Vec<Condition> {
    let mut out = existing.cloned().unwrap_or_default();
    match out.iter().position(|c| c.type_ == incoming.type_) {
        Some(idx) if out[idx].same_state(&incoming) => {}
        Some(idx) => out[idx] = incoming,
        None => out.push(incoming),
    }
    out
}
