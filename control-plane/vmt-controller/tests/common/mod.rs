#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vmt_controller::api::TemplateApi;
use vmt_controller::config::ControllerConfig;
use vmt_controller::controller::{k8s, run_controller};
use vmt_models::{
    ObjectKey, VirtualMachineTemplate, VirtualMachineTemplateSpec,
    VirtualMachineTemplateVersion, VirtualMachineTemplateVersionSpec,
};
use vmt_storage::Stores;

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

pub fn template(ns: &str, name: &str) -> VirtualMachineTemplate {
    let mut t = VirtualMachineTemplate::new(
        name,
        VirtualMachineTemplateSpec {
            description: "testing vm template".into(),
            default_version_id: None,
        },
    );
    t.metadata.namespace = Some(ns.into());
    t
}

pub fn version(ns: &str, name: &str, template_id: &str) -> VirtualMachineTemplateVersion {
    let mut v = VirtualMachineTemplateVersion::new(
        name,
        VirtualMachineTemplateVersionSpec {
            template_id: template_id.into(),
            description: Some("testing vm template version".into()),
            key_pair_ids: Vec::new(),
            vm: serde_json::json!({
                "running": false,
                "template": {"spec": {"domain": {"cpu": {"cores": 1}}}}
            }),
        },
    );
    v.metadata.namespace = Some(ns.into());
    v
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time: {what}");
}

pub fn test_config() -> ControllerConfig {
    let mut cfg = ControllerConfig::for_profile("dev");
    cfg.threadiness = 4;
    cfg.resync_secs = 1;
    cfg.backoff.base_ms = 10;
    cfg.backoff.max_secs = 1;
    cfg
}

// RAII guard: cancels the controller loop when the test ends
pub struct ControllerGuard {
    pub api: TemplateApi,
    pub stores: Stores,
    shutdown: CancellationToken,
    ctrl: Option<JoinHandle<anyhow::Result<()>>>,
}

impl ControllerGuard {
    pub fn start() -> Self {
        Self::start_with(Stores::memory(), test_config())
    }

    pub fn start_with(stores: Stores, cfg: ControllerConfig) -> Self {
        let shutdown = CancellationToken::new();
        let ctrl = tokio::spawn(run_controller(stores.clone(), cfg, shutdown.clone()));
        Self {
            api: TemplateApi::new(stores.clone()),
            stores,
            shutdown,
            ctrl: Some(ctrl),
        }
    }

    /// Run the reconcilers through kube-runtime against a live cluster.
    pub fn start_kube(client: kube::Client, cfg: ControllerConfig) -> Self {
        let stores = Stores::kube(client.clone());
        let shutdown = CancellationToken::new();
        let ctrl = tokio::spawn(k8s::run(client, stores.clone(), cfg, shutdown.clone()));
        Self {
            api: TemplateApi::new(stores.clone()),
            stores,
            shutdown,
            ctrl: Some(ctrl),
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.ctrl.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    pub async fn template(&self, ns: &str, name: &str) -> Option<VirtualMachineTemplate> {
        self.api
            .get_template(&ObjectKey::new(ns, name))
            .await
            .expect("get template")
    }

    pub async fn version(&self, ns: &str, name: &str) -> Option<VirtualMachineTemplateVersion> {
        self.api
            .get_version(&ObjectKey::new(ns, name))
            .await
            .expect("get version")
    }

    pub async fn counts(&self, ns: &str) -> (usize, usize) {
        let t = self.api.list_templates(Some(ns)).await.expect("list templates");
        let v = self.api.list_versions(Some(ns)).await.expect("list versions");
        (t.len(), v.len())
    }

    /// Wait until the version has been assigned a number and return it.
    pub async fn wait_sequenced(&self, ns: &str, name: &str) -> i64 {
        eventually(&format!("{ns}/{name} sequenced"), || async {
            self.version(ns, name)
                .await
                .and_then(|v| v.version_number())
                .is_some()
        })
        .await;
        self.version(ns, name)
            .await
            .and_then(|v| v.version_number())
            .expect("sequenced")
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(ref handle) = self.ctrl {
            handle.abort();
        }
    }
}
