use tracing::{info, instrument, warn};
use vmt_models::{
    ObjectKey, VirtualMachineTemplate, VirtualMachineTemplateVersion,
};
use vmt_storage::{StorageError, Stores};

use crate::admission::{AdmissionError, DeletionGuard, Validator};

/// In-process entry point for Template and TemplateVersion writes.
///
/// Every mutation is admitted exactly as the validating webhook would admit
/// it and only then handed to storage. Derived status is never written here.
#[derive(Clone)]
pub struct TemplateApi {
    stores: Stores,
    validator: Validator,
    guard: DeletionGuard,
}

impl TemplateApi {
    pub fn new(stores: Stores) -> Self {
        Self {
            validator: Validator::new(stores.clone()),
            guard: DeletionGuard::new(stores.clone()),
            stores,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    #[instrument(skip_all, fields(name = ?template.metadata.name))]
    pub async fn create_template(
        &self,
        template: &VirtualMachineTemplate,
    ) -> Result<VirtualMachineTemplate, AdmissionError> {
        self.validator.validate_template(None, template).await?;
        let created = self.stores.templates.create(template).await?;
        info!("template created");
        Ok(created)
    }

    /// Replace the template spec and metadata. The caller's
    /// `resourceVersion` is carried through, so stale writes conflict.
    #[instrument(skip_all, fields(name = ?template.metadata.name))]
    pub async fn update_template(
        &self,
        template: &VirtualMachineTemplate,
    ) -> Result<VirtualMachineTemplate, AdmissionError> {
        let key = template.key().map_err(StorageError::from)?;
        let old = self
            .stores
            .templates
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        self.validator.validate_template(Some(&old), template).await?;
        Ok(self.stores.templates.replace(template).await?)
    }

    /// Request deletion. The template stays visible in `Deleting` until all
    /// of its versions are gone.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete_template(&self, key: &ObjectKey) -> Result<(), AdmissionError> {
        self.stores.templates.delete(key).await?;
        info!("template deletion requested");
        Ok(())
    }

    #[instrument(skip_all, fields(name = ?version.metadata.name))]
    pub async fn create_version(
        &self,
        version: &VirtualMachineTemplateVersion,
    ) -> Result<VirtualMachineTemplateVersion, AdmissionError> {
        self.validator.validate_version_create(version).await?;
        let created = self.stores.versions.create(version).await?;
        info!(template = %created.spec.template_id, "version created");
        Ok(created)
    }

    #[instrument(skip_all, fields(name = ?version.metadata.name))]
    pub async fn update_version(
        &self,
        version: &VirtualMachineTemplateVersion,
    ) -> Result<VirtualMachineTemplateVersion, AdmissionError> {
        let key = version.key().map_err(StorageError::from)?;
        let old = self
            .stores
            .versions
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        self.validator.validate_version_update(&old, version)?;
        Ok(self.stores.versions.replace(version).await?)
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete_version(&self, key: &ObjectKey) -> Result<(), AdmissionError> {
        let version = self
            .stores
            .versions
            .get(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        self.guard.check_delete(&version).await?;
        self.stores.versions.delete(key).await?;
        info!("version deleted");

        // Storage cannot fence this delete on the template, so a default
        // change admitted in between can land on the deleted version. The
        // template reconciler then reports DefaultVersionValid=False.
        if let Err(AdmissionError::DeletionGuard(msg)) = self.guard.check_delete(&version).await {
            warn!(%msg, "default moved to this version while it was being deleted");
        }
        Ok(())
    }

    pub async fn get_template(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<VirtualMachineTemplate>, AdmissionError> {
        Ok(self.stores.templates.get(key).await?)
    }

    pub async fn get_version(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<VirtualMachineTemplateVersion>, AdmissionError> {
        Ok(self.stores.versions.get(key).await?)
    }

    pub async fn list_templates(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<VirtualMachineTemplate>, AdmissionError> {
        Ok(self.stores.templates.list(namespace).await?)
    }

    pub async fn list_versions(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<VirtualMachineTemplateVersion>, AdmissionError> {
        Ok(self.stores.versions.list(namespace).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use vmt_models::{
        ConditionStatus, ConditionType, VirtualMachineTemplateSpec,
        VirtualMachineTemplateVersionSpec,
    };
    use vmt_storage::{ObjectStore, StorageResult, TemplateStore, VersionStore, WatchEvent};

    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::{ControllerContext, template};

    /// Version store whose delete lets a default change through first, the
    /// way a concurrent template update would.
    struct DefaultMovesDuringDelete {
        inner: VersionStore,
        templates: TemplateStore,
        template: ObjectKey,
    }

    #[async_trait]
    impl ObjectStore<VirtualMachineTemplateVersion> for DefaultMovesDuringDelete {
        async fn get(&self, key: &ObjectKey) -> StorageResult<Option<VirtualMachineTemplateVersion>> {
            self.inner.get(key).await
        }
        async fn list(&self, namespace: Option<&str>) -> StorageResult<Vec<VirtualMachineTemplateVersion>> {
            self.inner.list(namespace).await
        }
        async fn create(&self, obj: &VirtualMachineTemplateVersion) -> StorageResult<VirtualMachineTemplateVersion> {
            self.inner.create(obj).await
        }
        async fn replace(&self, obj: &VirtualMachineTemplateVersion) -> StorageResult<VirtualMachineTemplateVersion> {
            self.inner.replace(obj).await
        }
        async fn replace_status(&self, obj: &VirtualMachineTemplateVersion) -> StorageResult<VirtualMachineTemplateVersion> {
            self.inner.replace_status(obj).await
        }
        async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
            if let Some(mut t) = self.templates.get(&self.template).await? {
                t.spec.default_version_id = Some(key.to_string());
                self.templates.replace(&t).await?;
            }
            self.inner.delete(key).await
        }
        fn watch(&self) -> BoxStream<'static, WatchEvent<VirtualMachineTemplateVersion>> {
            self.inner.watch()
        }
    }

    fn version(name: &str) -> VirtualMachineTemplateVersion {
        let mut v = VirtualMachineTemplateVersion::new(
            name,
            VirtualMachineTemplateVersionSpec {
                template_id: "ns/t".into(),
                ..Default::default()
            },
        );
        v.metadata.namespace = Some("ns".into());
        v
    }

    #[tokio::test]
    async fn default_moved_during_delete_is_reported_by_reconcile() {
        let base = Stores::memory();
        let template_key = ObjectKey::new("ns", "t");
        let stores = Stores::new(
            base.templates.clone(),
            Arc::new(DefaultMovesDuringDelete {
                inner: base.versions.clone(),
                templates: base.templates.clone(),
                template: template_key.clone(),
            }),
        );

        let mut t = VirtualMachineTemplate::new(
            "t",
            VirtualMachineTemplateSpec {
                description: String::new(),
                default_version_id: Some("ns/v1".into()),
            },
        );
        t.metadata.namespace = Some("ns".into());
        stores.templates.create(&t).await.unwrap();
        stores.versions.create(&version("v1")).await.unwrap();
        stores.versions.create(&version("v2")).await.unwrap();

        let api = TemplateApi::new(stores.clone());
        api.delete_version(&ObjectKey::new("ns", "v2")).await.unwrap();
        assert!(api.get_version(&ObjectKey::new("ns", "v2")).await.unwrap().is_none());

        let ctx = ControllerContext::new(stores.clone(), ControllerConfig::for_profile("dev"));
        template::reconcile(&template_key, &ctx).await.unwrap();

        let t = api.get_template(&template_key).await.unwrap().unwrap();
        assert_eq!(t.spec.default_version_id.as_deref(), Some("ns/v2"));
        let conditions = t.status.and_then(|s| s.conditions).unwrap();
        let valid = conditions
            .iter()
            .find(|c| c.type_ == ConditionType::DefaultVersionValid)
            .unwrap();
        assert_eq!(valid.status, ConditionStatus::False);
    }
}
