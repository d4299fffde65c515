use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use kube::core::object::{HasSpec, HasStatus};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;
use vmt_models::ObjectKey;

use crate::error::StorageError;
use crate::traits::*;

const WATCH_BUFFER: usize = 1024;

/// In-process object store mirroring the API server semantics the
/// controller relies on: resourceVersion compare-and-swap, a separate status
/// subresource, finalizer-gated deletion and a broadcast watch.
pub struct MemoryStore<K> {
    objects: Arc<RwLock<BTreeMap<ObjectKey, K>>>,
    revision: Arc<AtomicU64>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: Clone> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
            revision: self.revision.clone(),
            events: self.events.clone(),
        }
    }
}

impl<K: Clone> MemoryStore<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            revision: Arc::new(AtomicU64::new(0)),
            events,
        }
    }
}

impl<K: Clone> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone,
{
    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event);
    }

    fn check_revision(
        key: &ObjectKey,
        current: &K,
        incoming: &K,
    ) -> StorageResult<()> {
        match incoming.meta().resource_version.as_deref() {
            None => Ok(()),
            Some(rv) if Some(rv) == current.meta().resource_version.as_deref() => {
                Ok(())
            }
            Some(rv) => Err(StorageError::Conflict(format!(
                "{key}: resourceVersion {rv} is stale (current {})",
                current.meta().resource_version.as_deref().unwrap_or("")
            ))),
        }
    }
}

fn has_finalizers<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + HasSpec + HasStatus + Clone + Send + Sync + 'static,
    <K as HasSpec>::Spec: PartialEq + Clone + Send + Sync,
    <K as HasStatus>::Status: Clone + Send + Sync,
{
    async fn get(&self, key: &ObjectKey) -> StorageResult<Option<K>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> StorageResult<Vec<K>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(k, _)| namespace.map(|ns| k.namespace == ns).unwrap_or(true))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> StorageResult<K> {
        let key = ObjectKey::from_resource(obj)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        let mut stored = obj.clone();
        {
            let meta = stored.meta_mut();
            meta.namespace = Some(key.namespace.clone());
            meta.uid = Some(nanoid::nanoid!());
            meta.resource_version = Some(self.next_revision());
            meta.generation = Some(1);
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
        }
        // Status is a subresource and cannot be set on create.
        *stored.status_mut() = None;
        objects.insert(key.clone(), stored.clone());
        drop(objects);
        trace!(%key, "memory store: created");
        self.publish(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, obj: &K) -> StorageResult<K> {
        let key = ObjectKey::from_resource(obj)?;
        let mut objects = self.objects.write().await;
        let current = objects
            .get(&key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Self::check_revision(&key, current, obj)?;

        let mut stored = current.clone();
        let spec_changed = stored.spec() != obj.spec();
        *stored.spec_mut() = obj.spec().clone();
        {
            let incoming = obj.meta();
            let meta = stored.meta_mut();
            meta.labels = incoming.labels.clone();
            meta.annotations = incoming.annotations.clone();
            meta.finalizers = incoming.finalizers.clone();
            meta.owner_references = incoming.owner_references.clone();
            if spec_changed {
                meta.generation = Some(meta.generation.unwrap_or(0) + 1);
            }
            meta.resource_version = Some(self.next_revision());
        }

        if stored.meta().deletion_timestamp.is_some() && !has_finalizers(&stored) {
            objects.remove(&key);
            drop(objects);
            trace!(%key, "memory store: last finalizer removed, object deleted");
            self.publish(WatchEvent::Deleted(stored.clone()));
            return Ok(stored);
        }
        objects.insert(key, stored.clone());
        drop(objects);
        self.publish(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn replace_status(&self, obj: &K) -> StorageResult<K> {
        let key = ObjectKey::from_resource(obj)?;
        let mut objects = self.objects.write().await;
        let current = objects
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Self::check_revision(&key, current, obj)?;

        *current.status_mut() = obj.status().cloned();
        current.meta_mut().resource_version = Some(self.next_revision());
        let stored = current.clone();
        drop(objects);
        self.publish(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        if has_finalizers(current) {
            if current.meta().deletion_timestamp.is_none() {
                current.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                current.meta_mut().resource_version = Some(self.next_revision());
                let marked = current.clone();
                drop(objects);
                trace!(%key, "memory store: marked for deletion");
                self.publish(WatchEvent::Applied(marked));
            }
            return Ok(());
        }

        if let Some(removed) = objects.remove(key) {
            drop(objects);
            trace!(%key, "memory store: deleted");
            self.publish(WatchEvent::Deleted(removed));
        }
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        // Lagged receivers skip ahead; periodic resync covers what was missed.
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|ev| futures_util::future::ready(ev.ok()))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmt_models::{
        VirtualMachineTemplate, VirtualMachineTemplateSpec,
        VirtualMachineTemplateStatus,
    };

    fn template(name: &str) -> VirtualMachineTemplate {
        let mut t = VirtualMachineTemplate::new(
            name,
            VirtualMachineTemplateSpec {
                description: "d".into(),
                default_version_id: None,
            },
        );
        t.metadata.namespace = Some("ns".into());
        t
    }

    #[tokio::test]
    async fn stale_resource_version_is_a_conflict() {
        let store = MemoryStore::<VirtualMachineTemplate>::new();
        let created = store.create(&template("t")).await.unwrap();

        let mut first = created.clone();
        first.status = Some(VirtualMachineTemplateStatus {
            latest_version: 1,
            ..Default::default()
        });
        store.replace_status(&first).await.unwrap();

        let mut second = created;
        second.status = Some(VirtualMachineTemplateStatus {
            latest_version: 1,
            ..Default::default()
        });
        let err = store.replace_status(&second).await.unwrap_err();
        assert!(err.is_conflict(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn replace_ignores_status_and_bumps_generation_on_spec_change() {
        let store = MemoryStore::<VirtualMachineTemplate>::new();
        let created = store.create(&template("t")).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));

        let mut edited = created.clone();
        edited.spec.description = "changed".into();
        edited.status = Some(VirtualMachineTemplateStatus {
            latest_version: 42,
            ..Default::default()
        });
        let stored = store.replace(&edited).await.unwrap();
        assert_eq!(stored.metadata.generation, Some(2));
        assert!(stored.status.is_none());
        assert_ne!(stored.metadata.resource_version, created.metadata.resource_version);
    }
}
