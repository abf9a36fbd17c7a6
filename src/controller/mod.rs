//! Controller implementations
//!
//! Reconciliation logic for CAPI machines of RKE-managed clusters.

mod machine;

pub use machine::{
    bootstrap_channel, error_policy, machine_for_service_account, on_change,
    plan_channel_objects, reconcile, BootstrapChannel, Context, ContextBuilder, KubeClientImpl,
    MachineClient, PLAN_SECRET_VERBS,
};

#[cfg(test)]
pub use machine::MockMachineClient;
