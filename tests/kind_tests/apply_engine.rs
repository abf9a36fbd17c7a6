//! Integration tests for the apply engine
//!
//! A machine's generated objects are applied with server-side apply and
//! pruned when the machine stops declaring them.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::Api;
use kube::Client;

use rke_machine_operator::apply::{ApplyEngine, KubeObjectStore, OwnerKey, OWNER_NAME_LABEL};
use rke_machine_operator::controller::plan_channel_objects;
use rke_machine_operator::crd::{Machine, MachineSpec};
use rke_machine_operator::naming::plan_secret_name;
use rke_machine_operator::DEFAULT_FIELD_MANAGER;

use super::helpers::{cleanup_namespace, ensure_namespace, ensure_test_cluster};

fn machine(namespace: &str, name: &str) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: "c1".to_string(),
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(namespace.to_string());
    machine
}

fn engine(client: &Client) -> ApplyEngine {
    ApplyEngine::new(Arc::new(KubeObjectStore::new(
        client.clone(),
        DEFAULT_FIELD_MANAGER,
    )))
}

/// Story: the plan channel of a machine appears in the cluster and
/// disappears again once the machine no longer declares it
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_plan_channel_is_applied_and_pruned() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to connect to cluster");
    let ns = "rke-it-apply";
    ensure_namespace(&client, ns)
        .await
        .expect("failed to create namespace");

    let m1 = machine(ns, "m1");
    let owner = OwnerKey::new(ns, "m1");
    let name = plan_secret_name("m1");

    let summary = engine(&client)
        .apply(&owner, plan_channel_objects(&m1))
        .await
        .expect("apply should succeed");
    assert_eq!(summary.applied, 4);

    let sa: Api<ServiceAccount> = Api::namespaced(client.clone(), ns);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
    let roles: Api<Role> = Api::namespaced(client.clone(), ns);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), ns);

    let created = sa.get(&name).await.expect("service account should exist");
    assert_eq!(
        created.metadata.labels.unwrap().get(OWNER_NAME_LABEL).map(String::as_str),
        Some("m1")
    );
    assert!(secrets.get_opt(&name).await.unwrap().is_some());
    assert!(roles.get_opt(&name).await.unwrap().is_some());
    assert!(bindings.get_opt(&name).await.unwrap().is_some());

    // A fresh engine has no index and must find the objects by label.
    let summary = engine(&client)
        .apply(&owner, Vec::new())
        .await
        .expect("prune should succeed");
    assert_eq!(summary.pruned, 4);

    assert!(roles.get_opt(&name).await.unwrap().is_none());
    assert!(bindings.get_opt(&name).await.unwrap().is_none());

    cleanup_namespace(&client, ns).await;
}

/// Story: applying the same set twice is a no-op for the API server
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_reapply_keeps_resource_version() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to connect to cluster");
    let ns = "rke-it-reapply";
    ensure_namespace(&client, ns)
        .await
        .expect("failed to create namespace");

    let engine = engine(&client);
    let owner = OwnerKey::new(ns, "m2");
    let objects = plan_channel_objects(&machine(ns, "m2"));
    let roles: Api<Role> = Api::namespaced(client.clone(), ns);
    let name = plan_secret_name("m2");

    engine.apply(&owner, objects.clone()).await.unwrap();
    let before = roles.get(&name).await.unwrap().metadata.resource_version;
    let summary = engine.apply(&owner, objects).await.unwrap();
    let after = roles.get(&name).await.unwrap().metadata.resource_version;

    assert_eq!(summary.pruned, 0);
    assert_eq!(before, after);

    engine.apply(&owner, Vec::new()).await.unwrap();
    cleanup_namespace(&client, ns).await;
}
