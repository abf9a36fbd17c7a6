//! Shared helpers for integration tests

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use rke_machine_operator::crd::RKEBootstrap;
use rke_machine_operator::retry::{retry_with_backoff, RetryConfig};

const FIELD_MANAGER: &str = "rke-machine-integration";

/// Connect to the cluster of the current kubeconfig context
pub async fn ensure_test_cluster() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    retry_with_backoff(&RetryConfig::with_max_attempts(10), "apiserver_version", || {
        let client = client.clone();
        async move { client.apiserver_version().await }
    })
    .await?;
    Ok(client)
}

/// Create (or adopt) a namespace for one test
pub async fn ensure_namespace(client: &Client, name: &str) -> anyhow::Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

/// Delete a test namespace, ignoring errors
pub async fn cleanup_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// Install the RKEBootstrap CRD and wait until it is served
pub async fn ensure_rke_bootstrap_crd(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = RKEBootstrap::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    crds.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&crd))
        .await?;

    let bootstraps: Api<RKEBootstrap> = Api::all(client.clone());
    let config = RetryConfig {
        max_attempts: 20,
        initial_delay: Duration::from_millis(200),
        ..Default::default()
    };
    retry_with_backoff(&config, "rkebootstrap_crd_served", || {
        let bootstraps = bootstraps.clone();
        async move { bootstraps.list(&Default::default()).await }
    })
    .await?;
    Ok(())
}
