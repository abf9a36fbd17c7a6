//! Plan channel payload contract
//!
//! The operator only provisions the plan secret; the planner writes the
//! desired [`NodePlan`] into it and the node agent writes back what it
//! applied. Both sides must agree on the types and secret keys defined here.
//!
//! A node agent consumes a plan by writing every [`File`] to its path and
//! then running the [`Instruction`]s in order. It reports convergence by
//! replacing the applied plan; [`Node::in_sync`] is recomputed from the two.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

use crate::crd::{Machine, RKECluster};
use crate::{Error, Result};

/// Secret data key holding the desired plan (written by the planner)
pub const PLAN_KEY: &str = "plan";

/// Secret data key holding the last applied plan (written by the node agent)
pub const APPLIED_PLAN_KEY: &str = "appliedPlan";

/// Desired provisioning state for every node of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Nodes keyed by node identifier
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, Node>,

    /// Machine snapshots keyed by machine name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machines: BTreeMap<String, Machine>,

    /// Snapshot of the RKE cluster the plan was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<RKECluster>,
}

impl Plan {
    /// Whether every node has applied its current plan
    pub fn all_in_sync(&self) -> bool {
        self.nodes.values().all(|n| n.in_sync)
    }

    /// Identifiers of nodes that have not converged yet, in sorted order
    pub fn out_of_sync(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.in_sync)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// One node's desired and applied plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Plan the node should converge to
    #[serde(default)]
    pub plan: NodePlan,

    /// Last plan the node confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_plan: Option<NodePlan>,

    /// True iff `applied_plan` equals `plan`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_sync: bool,
}

impl Node {
    /// Node with a fresh desired plan and nothing applied yet
    pub fn new(plan: NodePlan) -> Self {
        Self {
            plan,
            applied_plan: None,
            in_sync: false,
        }
    }

    /// Record what the node reports as applied and recompute convergence
    pub fn record_applied(&mut self, applied: NodePlan) {
        self.applied_plan = Some(applied);
        self.recompute_in_sync();
    }

    /// Replace the desired plan and recompute convergence
    pub fn set_plan(&mut self, plan: NodePlan) {
        self.plan = plan;
        self.recompute_in_sync();
    }

    fn recompute_in_sync(&mut self) {
        self.in_sync = self.applied_plan.as_ref() == Some(&self.plan);
    }

    /// Decode a node from plan secret data.
    ///
    /// A secret with no `plan` key yields an empty desired plan: the planner
    /// has not written anything yet.
    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Result<Self> {
        let plan = match data.get(PLAN_KEY) {
            Some(bytes) => NodePlan::from_bytes(PLAN_KEY, &bytes.0)?,
            None => NodePlan::default(),
        };
        let applied_plan = data
            .get(APPLIED_PLAN_KEY)
            .map(|bytes| NodePlan::from_bytes(APPLIED_PLAN_KEY, &bytes.0))
            .transpose()?;

        let mut node = Self {
            plan,
            applied_plan,
            in_sync: false,
        };
        node.recompute_in_sync();
        Ok(node)
    }

    /// Encode this node as plan secret data
    pub fn to_secret_data(&self) -> Result<BTreeMap<String, ByteString>> {
        let mut data = BTreeMap::new();
        data.insert(PLAN_KEY.to_string(), ByteString(self.plan.to_bytes()?));
        if let Some(applied) = &self.applied_plan {
            data.insert(APPLIED_PLAN_KEY.to_string(), ByteString(applied.to_bytes()?));
        }
        Ok(data)
    }
}

/// Declarative recipe for one node: write these files, then run these steps
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    /// Files to write before running instructions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,

    /// Instructions to run in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<Instruction>,
}

impl NodePlan {
    /// Whether the plan does nothing
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.instructions.is_empty()
    }

    fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("plan secret key {key}: {e}")))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A single step executed on the node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// Step name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Image providing the execution context
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Environment assignments (`KEY=value`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Command to run
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

/// A file to place on the node
///
/// `name` is logical (`ca.pem`), `path` is where it lands
/// (`/etc/kubernetes/ssl`), `content` is base64 encoded.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Base64 encoded content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    /// Logical name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Filesystem path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Join tokens distributed alongside a plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Token servers use to join
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_token: String,

    /// Token agents use to join
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_token: String,
}
