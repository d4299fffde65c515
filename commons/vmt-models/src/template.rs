use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::key::{KeyError, ObjectKey};

#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default,
    PartialEq,
)]
#[kube(
    group = "vmt.io",
    version = "v1alpha1",
    kind = "VirtualMachineTemplate",
    plural = "virtualmachinetemplates",
    shortname = "vmtemplate",
    namespaced,
    status = "VirtualMachineTemplateStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Default","type":"integer","jsonPath":".status.defaultVersion"}"#,
    printcolumn = r#"{"name":"Latest","type":"integer","jsonPath":".status.latestVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateSpec {
    #[serde(default)]
    pub description: String,
    /// `namespace/name` of the TemplateVersion designated as default.
    /// Filled in by the controller for the first version when left empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version_id: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateStatus {
    /// Sequence number of the current default version (0 = none yet).
    #[serde(default)]
    pub default_version: i64,
    /// UID of the version holding `default_version`. Known as soon as the
    /// number is handed out, before the version's own status records it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version_uid: Option<String>,
    /// Highest sequence number ever handed out for this template.
    #[serde(default)]
    pub latest_version: i64,
    /// `namespace/name` of the version that received `latest_version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version_id: Option<String>,
    /// UID of that version. Re-sequencing the same object after a partial
    /// write returns the same number; a recreated namesake does not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TemplatePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Lifecycle of a template as seen by the reconciler. `Gone` has no stored
/// representation: the object simply no longer exists.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "PascalCase")]
pub enum TemplatePhase {
    Uninitialized,
    Initialized,
    Deleting,
}

impl std::fmt::Display for TemplatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplatePhase::Uninitialized => write!(f, "Uninitialized"),
            TemplatePhase::Initialized => write!(f, "Initialized"),
            TemplatePhase::Deleting => write!(f, "Deleting"),
        }
    }
}

impl VirtualMachineTemplate {
    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::from_resource(self)
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn status_or_default(&self) -> VirtualMachineTemplateStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Phase derived from the persisted object, independent of what the
    /// status block currently records.
    pub fn observed_phase(&self) -> TemplatePhase {
        if self.is_deleting() {
            return TemplatePhase::Deleting;
        }
        match self.status.as_ref() {
            Some(s) if s.latest_version > 0 => TemplatePhase::Initialized,
            _ => TemplatePhase::Uninitialized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_uses_camel_case_and_omits_missing_default() {
        let spec = VirtualMachineTemplateSpec {
            description: "testing vm template".into(),
            default_version_id: None,
        };
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({"description": "testing vm template"})
        );

        let parsed: VirtualMachineTemplateSpec = serde_json::from_value(
            json!({"description": "", "defaultVersionId": "ns/v1"}),
        )
        .unwrap();
        assert_eq!(parsed.default_version_id.as_deref(), Some("ns/v1"));
    }

    #[test]
    fn observed_phase_follows_status_and_deletion() {
        let mut tpl =
            VirtualMachineTemplate::new("t", VirtualMachineTemplateSpec::default());
        assert_eq!(tpl.observed_phase(), TemplatePhase::Uninitialized);

        tpl.status = Some(VirtualMachineTemplateStatus {
            default_version: 1,
            latest_version: 1,
            ..Default::default()
        });
        assert_eq!(tpl.observed_phase(), TemplatePhase::Initialized);

        tpl.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ),
        );
        assert_eq!(tpl.observed_phase(), TemplatePhase::Deleting);
    }
}
