use tracing::{debug, info};
use vmt_models::VirtualMachineTemplateVersion;
use vmt_storage::Stores;

use super::AdmissionError;
use crate::controller::default_tracker::holds_default;

/// Refuses to delete the TemplateVersion a live Template points at.
#[derive(Clone)]
pub struct DeletionGuard {
    stores: Stores,
}

impl DeletionGuard {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// The owning Template is read from storage on every call; a cached copy
    /// could miss a default change that just happened. Until the reconciler
    /// has filled in `spec.defaultVersionId`, the number recorded in
    /// `status.defaultVersion` is protected instead.
    pub async fn check_delete(
        &self,
        version: &VirtualMachineTemplateVersion,
    ) -> Result<(), AdmissionError> {
        let key = version.key().map_err(|e| {
            AdmissionError::validation(format!("metadata.name: {e}"))
        })?;
        let Ok(template_key) = version.template_key() else {
            return Ok(());
        };

        let template = match self.stores.templates.get(&template_key).await? {
            None => {
                debug!(version = %key, "owning template gone, delete allowed");
                return Ok(());
            }
            Some(t) if t.is_deleting() => {
                debug!(version = %key, "owning template deleting, delete allowed");
                return Ok(());
            }
            Some(t) => t,
        };

        if holds_default(&template, version) {
            info!(version = %key, template = %template_key, "refusing to delete default version");
            return Err(AdmissionError::DeletionGuard(format!(
                "{key} is the default version of template {template_key}; \
                 set another default before deleting it"
            )));
        }
        Ok(())
    }
}
