// Integration tests that expect a running k8s cluster with the vmt.io CRDs
// installed (`cargo run --bin crdgen | kubectl apply -f -`).
// Enable via: cargo test -p vmt-controller --test it_k8s -- --ignored

use kube::Client;
use vmt_models::ObjectKey;

mod common;
use common::{ControllerGuard, eventually, template, test_config, uniq, version};

const NS: &str = "default";

async fn cluster() -> ControllerGuard {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let client = Client::try_default().await.expect("kube client");
    ControllerGuard::start_kube(client, test_config())
}

#[test_log::test(tokio::test)]
#[ignore]
async fn sequencing_and_cascade_in_cluster() {
    let ctl = cluster().await;
    let name = uniq("vmt-it");
    let template_id = format!("{NS}/{name}");
    ctl.api.create_template(&template(NS, &name)).await.expect("create template");

    let v1 = format!("{name}-v1");
    let v2 = format!("{name}-v2");
    ctl.api.create_version(&version(NS, &v1, &template_id)).await.expect("v1");
    assert_eq!(ctl.wait_sequenced(NS, &v1).await, 1);
    ctl.api.create_version(&version(NS, &v2, &template_id)).await.expect("v2");
    assert_eq!(ctl.wait_sequenced(NS, &v2).await, 2);

    eventually("default pointer initialised", || async {
        ctl.template(NS, &name)
            .await
            .and_then(|t| t.spec.default_version_id)
            .as_deref()
            == Some(format!("{NS}/{v1}").as_str())
    })
    .await;

    let err = ctl.api.delete_version(&ObjectKey::new(NS, &v1)).await.unwrap_err();
    assert_eq!(err.status_code(), 403);

    ctl.api
        .delete_template(&ObjectKey::new(NS, &name))
        .await
        .expect("delete template");
    eventually("template and versions gone", || async {
        ctl.template(NS, &name).await.is_none()
            && ctl.version(NS, &v1).await.is_none()
            && ctl.version(NS, &v2).await.is_none()
    })
    .await;

    ctl.stop().await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn missing_template_reference_is_rejected_in_cluster() {
    let ctl = cluster().await;
    let name = uniq("vmt-it-orphan");
    let err = ctl
        .api
        .create_version(&version(NS, &name, &format!("{NS}/does-not-exist")))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert!(ctl.version(NS, &name).await.is_none());
    ctl.stop().await;
}
