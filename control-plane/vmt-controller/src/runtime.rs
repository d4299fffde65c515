use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vmt_storage::Stores;

use crate::api::TemplateApi;
use crate::config::ControllerConfig;
use crate::controller::k8s;
use crate::leader::LeaderElector;
use crate::seed::seed_default_templates;
use crate::web::run_http_server;

const API_SERVER_POLL: Duration = Duration::from_secs(2);

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &ControllerConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Block until the API server answers a version request.
pub async fn wait_for_api_server(client: &Client) {
    loop {
        match client.apiserver_version().await {
            Ok(v) => {
                info!(version = %v.git_version, "API server reachable");
                return;
            }
            Err(e) => {
                warn!(error = %e, "waiting for API server");
                tokio::time::sleep(API_SERVER_POLL).await;
            }
        }
    }
}

/// Spawn the webhook and health endpoint.
pub fn spawn_http(addr: SocketAddr, stores: Stores) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_http_server(addr, stores).await })
}

/// Seed built-ins (when enabled) and run the controllers until `shutdown`.
pub async fn run_leader_workload(
    client: Client,
    stores: Stores,
    cfg: ControllerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if cfg.seed_defaults() {
        let api = TemplateApi::new(stores.clone());
        seed_default_templates(&api, &cfg.namespace)
            .await
            .context("seeding default templates")?;
    }
    k8s::run(client, stores, cfg, shutdown).await
}

fn identity(cfg: &ControllerConfig) -> String {
    cfg.leader
        .identity
        .clone()
        .unwrap_or_else(|| format!("vmt-controller-{}", std::process::id()))
}

/// Start the HTTP server on every replica and the controllers on the
/// leader only. Returns when leadership is lost, the server fails or the
/// process is interrupted.
pub async fn run_all(client: Client, cfg: ControllerConfig) -> anyhow::Result<()> {
    wait_for_api_server(&client).await;

    let stores = Stores::kube(client.clone());
    let mut http = spawn_http(compute_http_addr(&cfg), stores.clone());
    let shutdown = CancellationToken::new();

    let mut guard = None;
    if cfg.leader_election() {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &cfg.leader.lease_name,
            &cfg.namespace,
            &identity(&cfg),
        ));
        tokio::select! {
            g = elector.acquire() => guard = Some(g),
            res = &mut http => return res?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }

    let mut workload = tokio::spawn(run_leader_workload(client, stores, cfg, shutdown.clone()));

    let result = match guard.as_mut() {
        Some(g) => tokio::select! {
            _ = g.lost() => Err(anyhow::anyhow!("leadership lost")),
            res = &mut http => res?,
            res = &mut workload => res?,
            _ = tokio::signal::ctrl_c() => Ok(()),
        },
        None => tokio::select! {
            res = &mut http => res?,
            res = &mut workload => res?,
            _ = tokio::signal::ctrl_c() => Ok(()),
        },
    };

    shutdown.cancel();
    if let Some(g) = guard.take() {
        if let Err(e) = g.release().await {
            warn!(error = %e, "failed to release lease");
        }
    }
    result
}
