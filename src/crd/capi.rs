//! Cluster API resource views
//!
//! Only the fields this operator reads are modelled. Both types are owned by
//! CAPI; the operator never writes them apart from its own finalizer on
//! `Machine`.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::api_group;
use crate::{RKE_API_VERSION, RKE_BOOTSTRAP_KIND, RKE_CLUSTER_KIND, RKE_GROUP};

/// Specification of a CAPI Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    namespaced,
    status = "MachineStatus",
    schema = "disabled",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the CAPI Cluster this machine belongs to (same namespace)
    pub cluster_name: String,

    /// Bootstrap configuration reference
    #[serde(default)]
    pub bootstrap: MachineBootstrap,

    /// Infrastructure machine reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Kubernetes version the machine should run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Provider-specific machine identifier
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Bootstrap section of a Machine spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    /// Reference to the bootstrap config resource serving this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Secret holding bootstrap data, once the config is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Observed state of a CAPI Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase as reported by CAPI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Whether the bootstrap data has been consumed
    #[serde(default)]
    pub bootstrap_ready: bool,

    /// Whether the infrastructure is ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Kubernetes Node this machine became
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,
}

/// CAPI machine lifecycle phases
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MachinePhase {
    /// Created, waiting for bootstrap and infrastructure
    Pending,
    /// Infrastructure is being provisioned
    Provisioning,
    /// Infrastructure exists, node not yet joined
    Provisioned,
    /// Node has joined and is running
    Running,
    /// Deletion in progress
    Deleting,
    /// Deleted
    Deleted,
    /// Irrecoverable failure
    Failed,
    /// Phase missing or not recognised
    #[default]
    Unknown,
}

impl MachinePhase {
    /// Whether a machine in this phase still needs its bootstrap credential.
    ///
    /// Includes `Deleting` and `Failed`: a machine can be torn down or fail
    /// before its node ever fetched the payload.
    pub fn needs_bootstrap(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Provisioning | Self::Deleting | Self::Failed
        )
    }
}

impl std::str::FromStr for MachinePhase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Pending" => Self::Pending,
            "Provisioning" => Self::Provisioning,
            "Provisioned" => Self::Provisioned,
            "Running" => Self::Running,
            "Deleting" => Self::Deleting,
            "Deleted" => Self::Deleted,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        })
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Provisioning => "Provisioning",
            Self::Provisioned => "Provisioned",
            Self::Running => "Running",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl Machine {
    /// Current lifecycle phase
    pub fn phase(&self) -> MachinePhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    /// The bootstrap configRef, if it points at an `RKEBootstrap` we serve
    pub fn rke_bootstrap_ref(&self) -> Option<&ObjectReference> {
        self.spec.bootstrap.config_ref.as_ref().filter(|r| {
            r.api_version.as_deref() == Some(RKE_API_VERSION)
                && r.kind.as_deref() == Some(RKE_BOOTSTRAP_KIND)
        })
    }
}

/// Specification of a CAPI Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus",
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Whether reconciliation of this cluster is paused
    #[serde(default)]
    pub paused: bool,

    /// Reference to the infrastructure cluster object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Reference to the control plane object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectReference>,
}

impl ClusterSpec {
    /// Whether this cluster's infrastructure is an `RKECluster`
    pub fn is_rke_cluster(&self) -> bool {
        let Some(infra) = &self.infrastructure_ref else {
            return false;
        };
        let group = infra.api_version.as_deref().map(api_group).unwrap_or("");
        group == RKE_GROUP && infra.kind.as_deref() == Some(RKE_CLUSTER_KIND)
    }
}

/// Observed state of a CAPI Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Lifecycle phase as reported by CAPI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Whether the infrastructure cluster is ready
    #[serde(default)]
    pub infrastructure_ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn infra(api_version: Option<&str>, kind: &str) -> ClusterSpec {
        ClusterSpec {
            infrastructure_ref: Some(ObjectReference {
                api_version: api_version.map(str::to_string),
                kind: Some(kind.to_string()),
                name: Some("c1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case::rke_v1(Some("rke.cattle.io/v1"), "RKECluster", true)]
    #[case::rke_other_version(Some("rke.cattle.io/v1beta9"), "RKECluster", true)]
    #[case::wrong_kind(Some("rke.cattle.io/v1"), "RKEControlPlane", false)]
    #[case::docker(Some("infrastructure.cluster.x-k8s.io/v1beta1"), "DockerCluster", false)]
    #[case::same_kind_other_group(Some("example.com/v1"), "RKECluster", false)]
    #[case::no_api_version(None, "RKECluster", false)]
    fn test_cluster_gate(
        #[case] api_version: Option<&str>,
        #[case] kind: &str,
        #[case] managed: bool,
    ) {
        assert_eq!(infra(api_version, kind).is_rke_cluster(), managed);
    }

    #[test]
    fn test_cluster_without_infrastructure_is_unmanaged() {
        assert!(!ClusterSpec::default().is_rke_cluster());
    }

    #[rstest]
    #[case("Pending", MachinePhase::Pending, true)]
    #[case("Provisioning", MachinePhase::Provisioning, true)]
    #[case("Provisioned", MachinePhase::Provisioned, false)]
    #[case("Running", MachinePhase::Running, false)]
    #[case("Deleting", MachinePhase::Deleting, true)]
    #[case("Deleted", MachinePhase::Deleted, false)]
    #[case("Failed", MachinePhase::Failed, true)]
    #[case("Rebooting", MachinePhase::Unknown, false)]
    fn test_phase_parsing_and_bootstrap_gate(
        #[case] raw: &str,
        #[case] phase: MachinePhase,
        #[case] needs_bootstrap: bool,
    ) {
        let parsed: MachinePhase = raw.parse().unwrap();
        assert_eq!(parsed, phase);
        assert_eq!(parsed.needs_bootstrap(), needs_bootstrap);
    }

    #[test]
    fn test_machine_without_status_has_unknown_phase() {
        let machine = Machine::new("m1", MachineSpec::default());
        assert_eq!(machine.phase(), MachinePhase::Unknown);
    }

    #[test]
    fn test_machine_deserializes_from_capi_json() {
        let machine: Machine = serde_json::from_value(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "m1", "namespace": "ns1"},
            "spec": {
                "clusterName": "c1",
                "bootstrap": {
                    "configRef": {
                        "apiVersion": "rke.cattle.io/v1",
                        "kind": "RKEBootstrap",
                        "name": "bs1"
                    }
                },
                "providerID": "docker://m1"
            },
            "status": {"phase": "Provisioning"}
        }))
        .unwrap();

        assert_eq!(machine.spec.cluster_name, "c1");
        assert_eq!(machine.phase(), MachinePhase::Provisioning);
        assert_eq!(machine.spec.provider_id.as_deref(), Some("docker://m1"));
        let config_ref = machine.rke_bootstrap_ref().unwrap();
        assert_eq!(config_ref.name.as_deref(), Some("bs1"));
    }

    #[test]
    fn test_foreign_bootstrap_ref_is_ignored() {
        let mut machine = Machine::new("m1", MachineSpec::default());
        machine.spec.bootstrap.config_ref = Some(ObjectReference {
            api_version: Some("bootstrap.cluster.x-k8s.io/v1beta1".to_string()),
            kind: Some("KubeadmConfig".to_string()),
            name: Some("kc1".to_string()),
            ..Default::default()
        });
        assert!(machine.rke_bootstrap_ref().is_none());
    }
}
