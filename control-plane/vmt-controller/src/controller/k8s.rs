//! Cluster deployment of the reconcilers on top of `kube::runtime`.
//!
//! Each resource kind gets its own [`Controller`], which owns watching,
//! per-object serialization and scheduling. The reconcile bodies are the
//! same storage-level functions the in-process driver uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use kube::runtime::controller::{Action as KubeAction, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vmt_models::{VirtualMachineTemplate, VirtualMachineTemplateVersion};
use vmt_storage::Stores;

use super::{Action, ControllerContext, ReconcileErr, WorkItem, into_internal, template, version};
use crate::config::ControllerConfig;
use crate::retry::backoff_delay;

struct KubeContext {
    inner: ControllerContext,
    failures: Mutex<HashMap<WorkItem, u32>>,
}

impl KubeContext {
    fn new(inner: ControllerContext) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Successful reconciles are revisited after the resync interval so the
    /// loop stays level-triggered even when a watch event is missed.
    fn succeeded(&self, item: &WorkItem, action: Action) -> KubeAction {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(item);
        }
        match action {
            Action::AwaitChange => KubeAction::requeue(self.inner.cfg.resync_interval()),
            Action::Requeue(after) => KubeAction::requeue(after),
        }
    }

    fn failed(&self, item: WorkItem, err: &ReconcileErr) -> KubeAction {
        let attempts = match self.failures.lock() {
            Ok(mut failures) => {
                let n = failures.entry(item.clone()).or_insert(0);
                *n += 1;
                *n
            }
            Err(_) => 1,
        };
        let delay = backoff_delay(&self.inner.cfg.backoff, attempts);
        warn!(%item, error = %err, attempts, ?delay, "reconcile failed, backing off");
        KubeAction::requeue(delay)
    }
}

async fn reconcile_template(
    obj: Arc<VirtualMachineTemplate>,
    ctx: Arc<KubeContext>,
) -> Result<KubeAction, ReconcileErr> {
    let key = obj.key().map_err(into_internal)?;
    let action = template::reconcile(&key, &ctx.inner).await?;
    Ok(ctx.succeeded(&WorkItem::Template(key), action))
}

fn template_error_policy(
    obj: Arc<VirtualMachineTemplate>,
    err: &ReconcileErr,
    ctx: Arc<KubeContext>,
) -> KubeAction {
    match obj.key() {
        Ok(key) => ctx.failed(WorkItem::Template(key), err),
        Err(_) => KubeAction::requeue(ctx.inner.cfg.backoff.max()),
    }
}

async fn reconcile_version(
    obj: Arc<VirtualMachineTemplateVersion>,
    ctx: Arc<KubeContext>,
) -> Result<KubeAction, ReconcileErr> {
    let key = obj.key().map_err(into_internal)?;
    let action = version::reconcile(&key, &ctx.inner).await?;
    Ok(ctx.succeeded(&WorkItem::Version(key), action))
}

fn version_error_policy(
    obj: Arc<VirtualMachineTemplateVersion>,
    err: &ReconcileErr,
    ctx: Arc<KubeContext>,
) -> KubeAction {
    match obj.key() {
        Ok(key) => ctx.failed(WorkItem::Version(key), err),
        Err(_) => KubeAction::requeue(ctx.inner.cfg.backoff.max()),
    }
}

/// Run the Template and TemplateVersion controllers against the cluster
/// until `shutdown` is cancelled.
pub async fn run(
    client: Client,
    stores: Stores,
    cfg: ControllerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ctx = Arc::new(KubeContext::new(ControllerContext::new(stores, cfg)));
    let templates: Api<VirtualMachineTemplate> = Api::all(client.clone());
    let versions: Api<VirtualMachineTemplateVersion> = Api::all(client);

    let template_ctrl = Controller::new(templates.clone(), Config::default())
        .owns(versions.clone(), Config::default())
        .run(reconcile_template, template_error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(template = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "template controller error"),
            }
        });

    let version_ctrl = Controller::new(versions, Config::default());
    let known = version_ctrl.store();
    let version_ctrl = version_ctrl
        // A default change re-derives `isDefault` on every version.
        .watches(templates, Config::default(), move |t: VirtualMachineTemplate| {
            let Ok(key) = t.key() else {
                return Vec::new();
            };
            known
                .state()
                .into_iter()
                .filter(|v| v.belongs_to(&key))
                .map(|v| ObjectRef::from_obj(v.as_ref()))
                .collect::<Vec<_>>()
        })
        .run(reconcile_version, version_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(version = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "version controller error"),
            }
        });

    info!("starting template controllers");
    tokio::select! {
        _ = shutdown.cancelled() => info!("stopping template controllers"),
        _ = async { tokio::join!(template_ctrl, version_ctrl) } => {
            warn!("template controllers exited");
        }
    }
    Ok(())
}
