//! Resource types read and written by the operator
//!
//! CAPI types are external and modelled without schemas; the RKE types carry
//! schemas so their CRDs can be printed with `--crd`.

mod capi;
mod rke;

pub use capi::{
    Cluster, ClusterSpec, ClusterStatus, Machine, MachineBootstrap, MachinePhase, MachineSpec,
    MachineStatus,
};
pub use rke::{
    Endpoint, RKEBootstrap, RKEBootstrapSpec, RKEBootstrapStatus, RKECluster, RKEClusterSpec,
    RKEClusterStatus,
};

/// Group part of an apiVersion string (`""` for the core group)
///
/// `"rke.cattle.io/v1"` yields `"rke.cattle.io"`, `"v1"` yields `""`.
pub fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}
