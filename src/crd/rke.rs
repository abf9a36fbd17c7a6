//! RKE Custom Resource Definitions
//!
//! `RKECluster` marks a CAPI cluster as managed by this operator and
//! `RKEBootstrap` is the bootstrap config whose status points CAPI at the
//! bootstrap secret of a machine.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an RKEBootstrap
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.cattle.io",
    version = "v1",
    kind = "RKEBootstrap",
    plural = "rkebootstraps",
    namespaced,
    status = "RKEBootstrapStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.dataSecretName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RKEBootstrapSpec {
    /// CAPI cluster the bootstrapped machine joins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

/// Status for an RKEBootstrap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RKEBootstrapStatus {
    /// Whether the bootstrap data secret is available
    #[serde(default)]
    pub ready: bool,

    /// Name of the secret holding the bootstrap payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

impl RKEBootstrap {
    /// Recorded bootstrap secret name, if any
    pub fn data_secret_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.data_secret_name.as_deref())
    }

    /// Whether the status already points at `secret_name`
    pub fn points_at(&self, secret_name: &str) -> bool {
        self.data_secret_name() == Some(secret_name)
    }
}

/// Specification for an RKECluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.cattle.io",
    version = "v1",
    kind = "RKECluster",
    plural = "rkeclusters",
    namespaced,
    status = "RKEClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RKEClusterSpec {
    /// Endpoint of the cluster's API server, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<Endpoint>,
}

/// Host and port of an API endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Endpoint {
    /// Hostname or IP
    pub host: String,
    /// Port
    pub port: i32,
}

/// Status for an RKECluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RKEClusterStatus {
    /// Whether the infrastructure is ready
    #[serde(default)]
    pub ready: bool,

    /// Generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
