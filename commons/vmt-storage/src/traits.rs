use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use vmt_models::{
    ObjectKey, VirtualMachineTemplate, VirtualMachineTemplateVersion,
};

use crate::error::StorageError;

pub type StorageResult<T> = Result<T, StorageError>;

/// Change notification. Delivery is at-least-once and may be reordered
/// across objects, so consumers must treat it as a hint and re-read.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Versioned object storage with optimistic concurrency.
///
/// `replace` and `replace_status` are conditioned on the
/// `metadata.resourceVersion` carried by the argument and fail with
/// [`StorageError::Conflict`] when it is stale. `replace` never touches the
/// status block and `replace_status` touches nothing else.
///
/// `delete` on an object that still carries finalizers only marks it with a
/// deletion timestamp; it disappears once the last finalizer is removed.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StorageResult<Option<K>>;
    async fn list(&self, namespace: Option<&str>) -> StorageResult<Vec<K>>;
    async fn create(&self, obj: &K) -> StorageResult<K>;
    async fn replace(&self, obj: &K) -> StorageResult<K>;
    async fn replace_status(&self, obj: &K) -> StorageResult<K>;
    async fn delete(&self, key: &ObjectKey) -> StorageResult<()>;
    fn watch(&self) -> BoxStream<'static, WatchEvent<K>>;
}

pub type TemplateStore = Arc<dyn ObjectStore<VirtualMachineTemplate>>;
pub type VersionStore = Arc<dyn ObjectStore<VirtualMachineTemplateVersion>>;

/// The pair of stores the template lifecycle operates on.
#[derive(Clone)]
pub struct Stores {
    pub templates: TemplateStore,
    pub versions: VersionStore,
}

impl Stores {
    pub fn new(templates: TemplateStore, versions: VersionStore) -> Self {
        Self {
            templates,
            versions,
        }
    }

    #[cfg(feature = "memory")]
    pub fn memory() -> Self {
        use crate::memory::MemoryStore;
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    #[cfg(feature = "k8s")]
    pub fn kube(client: kube::Client) -> Self {
        use crate::k8s::KubeStore;
        Self::new(
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(KubeStore::new(client)),
        )
    }

    /// All versions whose `spec.templateId` names `template`, including ones
    /// already marked for deletion.
    pub async fn versions_of(
        &self,
        template: &ObjectKey,
    ) -> StorageResult<Vec<VirtualMachineTemplateVersion>> {
        let all = self.versions.list(Some(&template.namespace)).await?;
        Ok(all.into_iter().filter(|v| v.belongs_to(template)).collect())
    }
}
