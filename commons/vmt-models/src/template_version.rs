use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::key::{KeyError, ObjectKey};

#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default,
    PartialEq,
)]
#[kube(
    group = "vmt.io",
    version = "v1alpha1",
    kind = "VirtualMachineTemplateVersion",
    plural = "virtualmachinetemplateversions",
    shortname = "vmtemplateversion",
    namespaced,
    status = "VirtualMachineTemplateVersionStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.templateId"}"#,
    printcolumn = r#"{"name":"Version","type":"integer","jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateVersionSpec {
    /// `namespace/name` of the owning Template. Required, immutable.
    #[serde(default)]
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_pair_ids: Vec<String>,
    /// Opaque virtual machine specification snapshot.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub vm: Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateVersionStatus {
    /// Sequence number within the owning template; set once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".into(),
        Value::Bool(true),
    );
    Schema::Object(obj)
}

impl VirtualMachineTemplateVersion {
    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::from_resource(self)
    }

    pub fn template_key(&self) -> Result<ObjectKey, KeyError> {
        self.spec.template_id.parse()
    }

    pub fn version_number(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.version)
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn belongs_to(&self, template: &ObjectKey) -> bool {
        self.template_key().map(|k| &k == template).unwrap_or(false)
    }
}
