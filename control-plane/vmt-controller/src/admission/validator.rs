use tracing::debug;
use vmt_models::{
    ObjectKey, VirtualMachineTemplate, VirtualMachineTemplateVersion,
};
use vmt_storage::Stores;

use super::AdmissionError;

/// Reference and immutability checks for Templates and TemplateVersions.
#[derive(Clone)]
pub struct Validator {
    stores: Stores,
}

impl Validator {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// A new version must name an existing, live Template in its own
    /// namespace.
    pub async fn validate_version_create(
        &self,
        version: &VirtualMachineTemplateVersion,
    ) -> Result<(), AdmissionError> {
        let key = version.key().map_err(|e| {
            AdmissionError::validation(format!("metadata.name: {e}"))
        })?;
        let template_key = version.template_key().map_err(|e| {
            AdmissionError::validation(format!("spec.templateId: {e}"))
        })?;

        if template_key.namespace != key.namespace {
            return Err(AdmissionError::validation(format!(
                "spec.templateId: template {template_key} must be in namespace {}",
                key.namespace
            )));
        }

        let template = self.stores.templates.get(&template_key).await?;
        match template {
            None => Err(AdmissionError::validation(format!(
                "spec.templateId: template {template_key} not found"
            ))),
            Some(t) if t.is_deleting() => Err(AdmissionError::validation(format!(
                "spec.templateId: template {template_key} is being deleted"
            ))),
            Some(_) => {
                debug!(version = %key, template = %template_key, "version admitted");
                Ok(())
            }
        }
    }

    /// `templateId` and the VM snapshot are fixed at creation.
    pub fn validate_version_update(
        &self,
        old: &VirtualMachineTemplateVersion,
        new: &VirtualMachineTemplateVersion,
    ) -> Result<(), AdmissionError> {
        if old.spec.template_id != new.spec.template_id {
            return Err(AdmissionError::validation(
                "spec.templateId is immutable",
            ));
        }
        if old.spec.vm != new.spec.vm {
            return Err(AdmissionError::validation("spec.vm is immutable"));
        }
        Ok(())
    }

    /// A changed `defaultVersionId` must name a live version owned by this
    /// Template. Unchanged values are not re-checked so that unrelated edits
    /// keep working while the reconciler reports a stale pointer.
    pub async fn validate_template(
        &self,
        old: Option<&VirtualMachineTemplate>,
        new: &VirtualMachineTemplate,
    ) -> Result<(), AdmissionError> {
        let key = new.key().map_err(|e| {
            AdmissionError::validation(format!("metadata.name: {e}"))
        })?;

        let previous = old.and_then(|o| o.spec.default_version_id.as_deref());
        let Some(requested) = new.spec.default_version_id.as_deref() else {
            return Ok(());
        };
        if Some(requested) == previous {
            return Ok(());
        }

        let version_key: ObjectKey = requested.parse().map_err(|e| {
            AdmissionError::validation(format!("spec.defaultVersionId: {e}"))
        })?;
        let version = self.stores.versions.get(&version_key).await?;
        match version {
            None => Err(AdmissionError::validation(format!(
                "spec.defaultVersionId: version {version_key} not found"
            ))),
            Some(v) if !v.belongs_to(&key) => {
                Err(AdmissionError::validation(format!(
                    "spec.defaultVersionId: version {version_key} belongs to {}, not {key}",
                    v.spec.template_id
                )))
            }
            Some(v) if v.is_deleting() => Err(AdmissionError::validation(format!(
                "spec.defaultVersionId: version {version_key} is being deleted"
            ))),
            Some(_) => Ok(()),
        }
    }
}
