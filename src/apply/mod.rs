//! Desired-set apply engine
//!
//! Reconcilers describe what should exist for an owner as a plain list of
//! [`DesiredObject`]s. [`ApplyEngine`] makes the cluster match that list:
//! every object is server-side applied, and anything applied for the same
//! owner on an earlier pass but missing now is deleted.
//!
//! Ownership is tracked two ways. Each applied object carries owner labels,
//! and an in-memory index remembers the object keys applied per owner. The
//! index is rebuilt from the labels the first time an owner is seen after a
//! restart, so orphans from before the restart are still pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::naming::safe_label_value;
use crate::{Error, Result};

/// Label carrying the owner's name on every applied object
pub const OWNER_NAME_LABEL: &str = "objectset.rke.cattle.io/owner-name";

/// Label carrying the owner's namespace on every applied object
pub const OWNER_NAMESPACE_LABEL: &str = "objectset.rke.cattle.io/owner-namespace";

/// Standard managed-by label
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on applied objects
pub const MANAGED_BY_VALUE: &str = "rke-machine-operator";

// =============================================================================
// Object identity
// =============================================================================

/// Kinds of object the engine can apply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// core/v1 Secret
    Secret,
    /// rbac/v1 Role
    Role,
    /// rbac/v1 RoleBinding
    RoleBinding,
}

impl ObjectKind {
    /// Every kind, in apply order
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::ServiceAccount,
        ObjectKind::Secret,
        ObjectKind::Role,
        ObjectKind::RoleBinding,
    ];

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::Secret => "Secret",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an applied object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object kind
    pub kind: ObjectKind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Identity of the resource a desired set is generated for
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    /// Owner namespace
    pub namespace: String,
    /// Owner name
    pub name: String,
}

impl OwnerKey {
    /// Build an owner key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Labels stamped onto every object applied for this owner.
    ///
    /// Owner names too long for a label value are hashed.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_NAME_LABEL.to_string(), safe_label_value(&self.name)),
            (OWNER_NAMESPACE_LABEL.to_string(), self.namespace.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    /// Label selector matching objects applied for this owner
    pub fn selector(&self) -> String {
        format!(
            "{}={},{}={}",
            OWNER_NAME_LABEL,
            safe_label_value(&self.name),
            OWNER_NAMESPACE_LABEL,
            self.namespace
        )
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Desired objects
// =============================================================================

/// An object a reconciler wants to exist
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DesiredObject {
    /// A service account (principal)
    ServiceAccount(ServiceAccount),
    /// A secret
    Secret(Secret),
    /// A namespaced role
    Role(Role),
    /// A namespaced role binding
    RoleBinding(RoleBinding),
}

impl DesiredObject {
    /// Kind of this object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::Secret(_) => ObjectKind::Secret,
            Self::Role(_) => ObjectKind::Role,
            Self::RoleBinding(_) => ObjectKind::RoleBinding,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::Role(o) => &o.metadata,
            Self::RoleBinding(o) => &o.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::Role(o) => &mut o.metadata,
            Self::RoleBinding(o) => &mut o.metadata,
        }
    }

    /// Object name (empty if unset)
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace (empty if unset)
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Identity of this object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace(), self.name())
    }

    /// Value of a label, if set
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    fn stamp_owner(&mut self, owner: &OwnerKey) {
        self.metadata_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(owner.labels());
    }
}

impl From<ServiceAccount> for DesiredObject {
    fn from(o: ServiceAccount) -> Self {
        Self::ServiceAccount(o)
    }
}

impl From<Secret> for DesiredObject {
    fn from(o: Secret) -> Self {
        Self::Secret(o)
    }
}

impl From<Role> for DesiredObject {
    fn from(o: Role) -> Self {
        Self::Role(o)
    }
}

impl From<RoleBinding> for DesiredObject {
    fn from(o: RoleBinding) -> Self {
        Self::RoleBinding(o)
    }
}

// =============================================================================
// Object store
// =============================================================================

/// Write access to the objects the engine manages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create or update an object
    async fn apply(&self, object: &DesiredObject) -> Result<()>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Keys of all objects labelled as applied for `owner`
    async fn list_owned(&self, owner: &OwnerKey) -> Result<Vec<ObjectKey>>;
}

/// Object store backed by the Kubernetes API with server-side apply
pub struct KubeObjectStore {
    client: Client,
    params: PatchParams,
}

impl KubeObjectStore {
    /// Create a store applying as `field_manager`
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            params: PatchParams::apply(field_manager).force(),
        }
    }

    async fn apply_typed<K>(&self, namespace: &str, name: &str, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &self.params, &Patch::Apply(object)).await?;
        Ok(())
    }

    async fn delete_typed<K>(&self, key: &ObjectKey) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_typed<K>(&self, kind: ObjectKind, owner: &OwnerKey) -> Result<Vec<ObjectKey>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &owner.namespace);
        let list = api
            .list_metadata(&ListParams::default().labels(&owner.selector()))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|m| m.metadata.name)
            .map(|name| ObjectKey::new(kind, owner.namespace.clone(), name))
            .collect())
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn apply(&self, object: &DesiredObject) -> Result<()> {
        let (namespace, name) = (object.namespace(), object.name());
        match object {
            DesiredObject::ServiceAccount(o) => self.apply_typed(namespace, name, o).await,
            DesiredObject::Secret(o) => self.apply_typed(namespace, name, o).await,
            DesiredObject::Role(o) => self.apply_typed(namespace, name, o).await,
            DesiredObject::RoleBinding(o) => self.apply_typed(namespace, name, o).await,
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match key.kind {
            ObjectKind::ServiceAccount => self.delete_typed::<ServiceAccount>(key).await,
            ObjectKind::Secret => self.delete_typed::<Secret>(key).await,
            ObjectKind::Role => self.delete_typed::<Role>(key).await,
            ObjectKind::RoleBinding => self.delete_typed::<RoleBinding>(key).await,
        }
    }

    async fn list_owned(&self, owner: &OwnerKey) -> Result<Vec<ObjectKey>> {
        let mut keys = Vec::new();
        for kind in ObjectKind::ALL {
            let found = match kind {
                ObjectKind::ServiceAccount => self.list_typed::<ServiceAccount>(kind, owner).await?,
                ObjectKind::Secret => self.list_typed::<Secret>(kind, owner).await?,
                ObjectKind::Role => self.list_typed::<Role>(kind, owner).await?,
                ObjectKind::RoleBinding => self.list_typed::<RoleBinding>(kind, owner).await?,
            };
            keys.extend(found);
        }
        Ok(keys)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Outcome of one apply pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Objects created or updated
    pub applied: usize,
    /// Orphans deleted
    pub pruned: usize,
}

/// Applies desired sets and prunes what an owner no longer declares
pub struct ApplyEngine {
    store: Arc<dyn ObjectStore>,
    index: DashMap<OwnerKey, BTreeSet<ObjectKey>>,
}

impl ApplyEngine {
    /// Create an engine writing through `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            index: DashMap::new(),
        }
    }

    /// Keys currently recorded for `owner`
    pub fn owned(&self, owner: &OwnerKey) -> Option<BTreeSet<ObjectKey>> {
        self.index.get(owner).map(|e| e.value().clone())
    }

    /// Make the objects of `owner` match `objects` exactly.
    ///
    /// An empty `objects` removes everything previously applied for the
    /// owner and leaves no index entry behind. Two objects with the same key
    /// are rejected before anything is written.
    pub async fn apply(
        &self,
        owner: &OwnerKey,
        mut objects: Vec<DesiredObject>,
    ) -> Result<ApplySummary> {
        let mut desired = BTreeSet::new();
        for object in &mut objects {
            if !desired.insert(object.key()) {
                return Err(Error::validation(format!(
                    "desired set for {owner} contains {} twice",
                    object.key()
                )));
            }
            object.stamp_owner(owner);
        }

        let previous = match self.owned(owner) {
            Some(keys) => keys,
            None => {
                let keys: BTreeSet<_> = self.store.list_owned(owner).await?.into_iter().collect();
                debug!(owner = %owner, count = keys.len(), "rebuilt ownership index from labels");
                keys
            }
        };

        // Until pruning succeeds the owner owns the union, including
        // objects written by this pass before any failure.
        let orphans: Vec<ObjectKey> = previous.difference(&desired).cloned().collect();
        let claimed: BTreeSet<ObjectKey> = previous.union(&desired).cloned().collect();
        if !claimed.is_empty() {
            self.index.insert(owner.clone(), claimed);
        }

        let store = &self.store;
        try_join_all(objects.iter().map(|o| store.apply(o))).await?;

        if !orphans.is_empty() {
            try_join_all(orphans.iter().map(|k| store.delete(k))).await?;
            for key in &orphans {
                info!(owner = %owner, object = %key, "pruned orphaned object");
            }
        }

        if desired.is_empty() {
            self.index.remove(owner);
        } else {
            self.index.insert(owner.clone(), desired);
        }

        Ok(ApplySummary {
            applied: objects.len(),
            pruned: orphans.len(),
        })
    }

    /// Drop the index entry for an owner that no longer exists
    pub fn forget(&self, owner: &OwnerKey) {
        self.index.remove(owner);
    }
}
