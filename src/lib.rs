//! RKE machine operator - plan and bootstrap channels for CAPI machines
//!
//! For every CAPI `Machine` that belongs to an RKE-managed cluster, the operator
//! declares a least-privilege credential and a per-node "plan" secret through
//! which provisioning instructions flow to the node and convergence flows back.
//! Machines that are still joining additionally get a bootstrap credential whose
//! token fingerprint is embedded in a one-time bootstrap payload.
//!
//! # Modules
//!
//! - [`crd`] - Typed views of CAPI and RKE resources
//! - [`plan`] - Plan channel payload contract shared with the planner and node agent
//! - [`bootstrap`] - Bootstrap payload resolution from service account tokens
//! - [`controller`] - Machine reconciliation and the service account trigger
//! - [`apply`] - Desired-set apply engine with per-owner orphan pruning
//! - [`naming`] - Deterministic, length-safe resource names
//! - [`retry`] - Exponential backoff for startup operations
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod apply;
pub mod bootstrap;
pub mod controller;
pub mod crd;
pub mod error;
pub mod naming;
pub mod plan;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// API identity
// =============================================================================

/// API group of the RKE resources this operator manages
pub const RKE_GROUP: &str = "rke.cattle.io";

/// Full apiVersion a bootstrap configRef must carry to be handled here
pub const RKE_API_VERSION: &str = "rke.cattle.io/v1";

/// Infrastructure kind that marks a CAPI cluster as RKE-managed
pub const RKE_CLUSTER_KIND: &str = "RKECluster";

/// Bootstrap config kind served by this operator
pub const RKE_BOOTSTRAP_KIND: &str = "RKEBootstrap";

// =============================================================================
// Labels and secret types
// =============================================================================

/// Label carrying the owning machine's name on generated objects.
///
/// Names longer than a label value allows are hashed, see
/// [`naming::safe_label_value`].
pub const MACHINE_NAME_LABEL: &str = "rke.cattle.io/machine-name";

/// Annotation carrying the owning machine's full name on service accounts
pub const MACHINE_NAME_ANNOTATION: &str = "rke.cattle.io/machine-name";

/// Label carrying the CAPI cluster name on plan service accounts
pub const CLUSTER_NAME_LABEL: &str = "rke.cattle.io/cluster-name";

/// Label describing which channel a service account belongs to
pub const ROLE_LABEL: &str = "rke.cattle.io/service-account-role";

/// Label pointing a plan service account at its plan secret
pub const PLAN_SECRET_LABEL: &str = "rke.cattle.io/plan-secret-name";

/// Value of [`ROLE_LABEL`] for bootstrap service accounts
pub const ROLE_BOOTSTRAP: &str = "bootstrap";

/// Value of [`ROLE_LABEL`] for plan service accounts
pub const ROLE_PLAN: &str = "plan";

/// Secret type of the per-machine plan secret
pub const MACHINE_PLAN_SECRET_TYPE: &str = "rke.cattle.io/machine-plan";

/// Secret type of the computed bootstrap secret
pub const BOOTSTRAP_SECRET_TYPE: &str = "rke.cattle.io/bootstrap";

/// Data key holding the bootstrap payload
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Finalizer placed on managed machines so generated objects are pruned on delete
pub const MACHINE_FINALIZER: &str = "rke.cattle.io/machine";

/// Default field manager for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "rke-machine";
