pub mod cascade;
pub mod default_tracker;
pub mod k8s;
pub mod queue;
pub mod sequencer;
pub mod status;
pub mod template;
pub mod version;

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmt_models::{
    ObjectKey, VirtualMachineTemplate, VirtualMachineTemplateVersion,
};
use vmt_storage::{StorageError, Stores, WatchEvent};

use crate::config::ControllerConfig;
use crate::retry::RetryConfig;
pub use queue::{WorkItem, WorkQueue};

/// Finalizer holding a Template until its versions are gone.
pub const FINALIZER: &str = "vmt.io/template-versions";

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the object changes.
    AwaitChange,
    Requeue(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub stores: Stores,
    pub cfg: ControllerConfig,
    pub retry: RetryConfig,
}

impl ControllerContext {
    pub fn new(stores: Stores, cfg: ControllerConfig) -> Self {
        Self {
            stores,
            cfg,
            retry: RetryConfig::default(),
        }
    }
}

/// Run the reconciliation loop over any [`Stores`] until `shutdown` is
/// cancelled. This is the in-process driver; cluster deployments run the
/// same reconcilers through [`k8s::run`].
///
/// Watch events and the periodic resync only enqueue keys; `threadiness`
/// workers drain the queue and re-read every object they handle.
pub async fn run_controller(
    stores: Stores,
    cfg: ControllerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let queue = WorkQueue::new(cfg.backoff.clone());
    let ctx = Arc::new(ControllerContext::new(stores, cfg));
    info!(
        threadiness = ctx.cfg.threadiness,
        resync_secs = ctx.cfg.resync_secs,
        "starting template controllers"
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(pump_templates(ctx.clone(), queue.clone(), shutdown.clone()));
    tasks.spawn(pump_versions(ctx.clone(), queue.clone(), shutdown.clone()));
    tasks.spawn(resync(ctx.clone(), queue.clone(), shutdown.clone()));
    for id in 0..ctx.cfg.threadiness.max(1) {
        tasks.spawn(worker(id, ctx.clone(), queue.clone()));
    }

    shutdown.cancelled().await;
    info!("stopping template controllers");
    queue.shutdown().await;
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "controller task failed");
        }
    }
    Ok(())
}

async fn worker(id: usize, ctx: Arc<ControllerContext>, queue: WorkQueue) {
    while let Some(item) = queue.next().await {
        let res = match &item {
            WorkItem::Template(key) => template::reconcile(key, &ctx).await,
            WorkItem::Version(key) => version::reconcile(key, &ctx).await,
        };
        match res {
            Ok(Action::AwaitChange) => {
                queue.forget(&item).await;
                debug!(worker = id, %item, "reconciled");
            }
            Ok(Action::Requeue(after)) => {
                queue.forget(&item).await;
                debug!(worker = id, %item, ?after, "reconciled, requeue");
                queue.add_after(item.clone(), after);
            }
            Err(e) => {
                let delay = queue.add_rate_limited(item.clone()).await;
                warn!(worker = id, %item, error = %e, ?delay, "reconcile failed, backing off");
            }
        }
        queue.done(&item).await;
    }
    debug!(worker = id, "worker stopped");
}

async fn pump_templates(
    ctx: Arc<ControllerContext>,
    queue: WorkQueue,
    shutdown: CancellationToken,
) {
    let mut events = ctx.stores.templates.watch();
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = events.next() => ev,
        };
        let Some(ev) = ev else {
            warn!("template watch ended");
            break;
        };
        let Ok(key) = ev.object().key() else {
            continue;
        };
        queue.add(WorkItem::Template(key.clone())).await;
        // Default changes re-derive `isDefault` on every version.
        if matches!(ev, WatchEvent::Applied(_)) {
            enqueue_versions_of(&ctx, &queue, &key).await;
        }
    }
}

async fn pump_versions(
    ctx: Arc<ControllerContext>,
    queue: WorkQueue,
    shutdown: CancellationToken,
) {
    let mut events = ctx.stores.versions.watch();
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = events.next() => ev,
        };
        let Some(ev) = ev else {
            warn!("version watch ended");
            break;
        };
        let version: &VirtualMachineTemplateVersion = ev.object();
        if let Ok(key) = version.key() {
            queue.add(WorkItem::Version(key)).await;
        }
        if let Ok(template) = version.template_key() {
            queue.add(WorkItem::Template(template)).await;
        }
    }
}

async fn enqueue_versions_of(ctx: &ControllerContext, queue: &WorkQueue, key: &ObjectKey) {
    match ctx.stores.versions_of(key).await {
        Ok(versions) => {
            for v in versions {
                if let Ok(k) = v.key() {
                    queue.add(WorkItem::Version(k)).await;
                }
            }
        }
        Err(e) => warn!(template = %key, error = %e, "listing versions failed"),
    }
}

/// Re-enqueue everything on a fixed interval. The first tick fires
/// immediately and doubles as the initial sync.
async fn resync(ctx: Arc<ControllerContext>, queue: WorkQueue, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.cfg.resync_interval());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let templates: Vec<VirtualMachineTemplate> =
            match ctx.stores.templates.list(None).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "resync: listing templates failed");
                    continue;
                }
            };
        let versions = match ctx.stores.versions.list(None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "resync: listing versions failed");
                continue;
            }
        };
        debug!(templates = templates.len(), versions = versions.len(), "resync");
        for t in &templates {
            if let Ok(k) = t.key() {
                queue.add(WorkItem::Template(k)).await;
            }
        }
        for v in &versions {
            if let Ok(k) = v.key() {
                queue.add(WorkItem::Version(k)).await;
            }
        }
    }
}

pub(crate) fn into_internal<E: std::fmt::Display>(e: E) -> ReconcileErr {
    ReconcileErr::Internal(e.to_string())
}
