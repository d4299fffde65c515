use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use vmt_models::ObjectKey;

use crate::error::StorageError;
use crate::traits::*;

/// Store backed by the Kubernetes API server. Concurrency control is the
/// API server's own resourceVersion check.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl From<kube::Error> for StorageError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => StorageError::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => {
                    StorageError::AlreadyExists(ae.message)
                }
                409 => StorageError::Conflict(ae.message),
                code => StorageError::Rejected {
                    code,
                    message: ae.message,
                },
            },
            other => StorageError::Backend(other.to_string()),
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StorageResult<Option<K>> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list(&self, namespace: Option<&str>) -> StorageResult<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn create(&self, obj: &K) -> StorageResult<K> {
        let key = ObjectKey::from_resource(obj)?;
        Ok(self
            .api(&key.namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(&self, obj: &K) -> StorageResult<K> {
        let key = ObjectKey::from_resource(obj)?;
        Ok(self
            .api(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status(&self, obj: &K) -> StorageResult<K> {
        let key = ObjectKey::from_resource(obj)?;
        let body = serde_json::to_vec(obj)?;
        Ok(self
            .api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await?)
    }

    async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|ev| async move {
                match ev {
                    Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                        Some(WatchEvent::Applied(obj))
                    }
                    Ok(Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                    Ok(Event::Init) | Ok(Event::InitDone) => {
                        debug!("watcher (re)initialized");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "watcher error, stream will retry");
                        None
                    }
                }
            })
            .boxed()
    }
}
