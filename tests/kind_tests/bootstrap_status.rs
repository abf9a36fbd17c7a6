//! Integration tests for the RKEBootstrap status write

use kube::api::{Api, PostParams};

use rke_machine_operator::controller::{KubeClientImpl, MachineClient};
use rke_machine_operator::crd::{RKEBootstrap, RKEBootstrapStatus};

use super::helpers::{
    cleanup_namespace, ensure_namespace, ensure_rke_bootstrap_crd, ensure_test_cluster,
};

/// Story: the bootstrap config is pointed at the bootstrap secret, and a
/// write based on a stale read is rejected instead of clobbering
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_write_is_guarded_by_resource_version() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to connect to cluster");
    ensure_rke_bootstrap_crd(&client)
        .await
        .expect("failed to install RKEBootstrap CRD");
    let ns = "rke-it-status";
    ensure_namespace(&client, ns)
        .await
        .expect("failed to create namespace");

    let api: Api<RKEBootstrap> = Api::namespaced(client.clone(), ns);
    let mut bs1 = RKEBootstrap::new("bs1", Default::default());
    bs1.metadata.namespace = Some(ns.to_string());
    api.create(&PostParams::default(), &bs1)
        .await
        .expect("failed to create RKEBootstrap");

    let kube = KubeClientImpl::new(client.clone());
    let observed = kube.get_rke_bootstrap(ns, "bs1").await.unwrap();
    let status = RKEBootstrapStatus {
        ready: true,
        data_secret_name: Some("m1-machine-bootstrap".to_string()),
    };
    kube.update_rke_bootstrap_status(&observed, &status)
        .await
        .expect("status write should succeed");

    let updated = kube.get_rke_bootstrap(ns, "bs1").await.unwrap();
    assert!(updated.points_at("m1-machine-bootstrap"));
    assert!(updated.status.as_ref().unwrap().ready);

    // `observed` now carries an outdated resourceVersion.
    let err = kube
        .update_rke_bootstrap_status(&observed, &status)
        .await
        .expect_err("stale write should conflict");
    assert!(err.to_string().contains("kubernetes error"));

    cleanup_namespace(&client, ns).await;
}
