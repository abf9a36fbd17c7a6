//! CAPI Machine controller implementation
//!
//! Every pass recomputes the complete set of objects a machine should have
//! and hands it to the [`ApplyEngine`], which creates, updates and prunes to
//! match. The only direct write is the `RKEBootstrap` status, which points
//! CAPI at the computed bootstrap secret once it exists.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::apply::{ApplyEngine, DesiredObject, KubeObjectStore, ObjectStore, OwnerKey};
use crate::bootstrap::{
    BootstrapContent, BootstrapResolver, CredentialSource, InstallScript, KubeSettings,
};
use crate::crd::{Cluster, Machine, MachineStatus, RKEBootstrap, RKEBootstrapStatus};
use crate::naming::{bootstrap_principal_name, plan_secret_name, safe_label_value};
use crate::{
    Error, Result, CLUSTER_NAME_LABEL, DEFAULT_FIELD_MANAGER, MACHINE_FINALIZER,
    MACHINE_NAME_ANNOTATION, MACHINE_NAME_LABEL, MACHINE_PLAN_SECRET_TYPE, PLAN_SECRET_LABEL, ROLE_BOOTSTRAP, ROLE_LABEL,
    ROLE_PLAN,
};

/// Verbs the plan principal holds on its own plan secret
pub const PLAN_SECRET_VERBS: [&str; 4] = ["watch", "get", "update", "list"];

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Trait abstracting the Kubernetes reads and writes of the machine controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Get the CAPI Cluster a machine belongs to
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Cluster>;

    /// Get the RKEBootstrap named by a machine's configRef
    async fn get_rke_bootstrap(&self, namespace: &str, name: &str) -> Result<RKEBootstrap>;

    /// Replace the status of `bootstrap`
    ///
    /// The write carries the resource version of `bootstrap`, so it fails
    /// with a conflict if the object changed since it was read.
    async fn update_rke_bootstrap_status(
        &self,
        bootstrap: &RKEBootstrap,
        status: &RKEBootstrapStatus,
    ) -> Result<()>;

    /// Add the machine finalizer
    async fn add_finalizer(&self, machine: &Machine) -> Result<()>;

    /// Remove the machine finalizer
    async fn remove_finalizer(&self, machine: &Machine) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_finalizers(&self, machine: &Machine, finalizers: Vec<String>) -> Result<()> {
        let namespace = machine.namespace().unwrap_or_default();
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": machine.resource_version(),
            }
        });
        api.patch(
            &machine.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MachineClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Cluster> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("Cluster", namespace, name))
    }

    async fn get_rke_bootstrap(&self, namespace: &str, name: &str) -> Result<RKEBootstrap> {
        let api: Api<RKEBootstrap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("RKEBootstrap", namespace, name))
    }

    async fn update_rke_bootstrap_status(
        &self,
        bootstrap: &RKEBootstrap,
        status: &RKEBootstrapStatus,
    ) -> Result<()> {
        let namespace = bootstrap.namespace().unwrap_or_default();
        let api: Api<RKEBootstrap> = Api::namespaced(self.client.clone(), &namespace);

        let status_patch = serde_json::json!({
            "metadata": { "resourceVersion": bootstrap.resource_version() },
            "status": status,
        });

        api.patch_status(
            &bootstrap.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn add_finalizer(&self, machine: &Machine) -> Result<()> {
        let mut finalizers = machine.finalizers().to_vec();
        if finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(MACHINE_FINALIZER.to_string());
        self.patch_finalizers(machine, finalizers).await
    }

    async fn remove_finalizer(&self, machine: &Machine) -> Result<()> {
        let finalizers: Vec<String> = machine
            .finalizers()
            .iter()
            .filter(|f| *f != MACHINE_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(machine, finalizers).await
    }
}

#[async_trait]
impl CredentialSource for KubeClientImpl {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .field_manager("rke-machine")
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn MachineClient>,
    /// Derives bootstrap secrets from service account tokens
    pub bootstrap: BootstrapResolver,
    /// Applies desired sets and prunes orphans per machine
    pub apply: ApplyEngine,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn MachineClient>,
        credentials: Arc<dyn CredentialSource>,
        content: Arc<dyn BootstrapContent>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            kube,
            bootstrap: BootstrapResolver::new(credentials, content),
            apply: ApplyEngine::new(store),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    field_manager: String,
    kube: Option<Arc<dyn MachineClient>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    content: Option<Arc<dyn BootstrapContent>>,
    store: Option<Arc<dyn ObjectStore>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            kube: None,
            credentials: None,
            content: None,
            store: None,
        }
    }

    /// Set the server-side apply field manager
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Override the machine client
    pub fn machine_client(mut self, kube: Arc<dyn MachineClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override where service accounts and token secrets are read from
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the bootstrap payload provider
    pub fn content(mut self, content: Arc<dyn BootstrapContent>) -> Self {
        self.content = Some(content);
        self
    }

    /// Override the object store the apply engine writes through
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let default_client = Arc::new(KubeClientImpl::new(self.client.clone()));
        let kube = self.kube.unwrap_or_else(|| default_client.clone());
        let credentials = self.credentials.unwrap_or(default_client);
        let content = self.content.unwrap_or_else(|| {
            Arc::new(InstallScript::new(Arc::new(KubeSettings::new(
                self.client.clone(),
            ))))
        });
        let store = self.store.unwrap_or_else(|| {
            Arc::new(KubeObjectStore::new(self.client.clone(), &self.field_manager))
        });

        Context {
            kube,
            bootstrap: BootstrapResolver::new(credentials, content),
            apply: ApplyEngine::new(store),
        }
    }
}

// =============================================================================
// Plan channel
// =============================================================================

fn meta(namespace: &str, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: (!labels.is_empty()).then_some(labels),
        ..Default::default()
    }
}

/// Service accounts keep the full machine name, labels may only hold a hash of it
fn machine_annotation(machine_name: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(
        MACHINE_NAME_ANNOTATION.to_string(),
        machine_name.to_string(),
    )]))
}

/// Credential bundle and secret through which a node exchanges its plan.
///
/// Four objects sharing one name: a service account, the plan secret, a role
/// granting exactly [`PLAN_SECRET_VERBS`] on that one secret, and the binding
/// between them.
pub fn plan_channel_objects(machine: &Machine) -> Vec<DesiredObject> {
    let machine_name = machine.name_any();
    let namespace = machine.namespace().unwrap_or_default();
    let name = plan_secret_name(&machine_name);
    let machine_label = safe_label_value(&machine_name);

    let service_account = ServiceAccount {
        metadata: ObjectMeta {
            annotations: machine_annotation(&machine_name),
            ..meta(
                &namespace,
                &name,
                BTreeMap::from([
                    (
                        CLUSTER_NAME_LABEL.to_string(),
                        safe_label_value(&machine.spec.cluster_name),
                    ),
                    (MACHINE_NAME_LABEL.to_string(), machine_label.clone()),
                    (ROLE_LABEL.to_string(), ROLE_PLAN.to_string()),
                    (PLAN_SECRET_LABEL.to_string(), name.clone()),
                ]),
            )
        },
        ..Default::default()
    };

    let secret = Secret {
        metadata: meta(
            &namespace,
            &name,
            BTreeMap::from([(MACHINE_NAME_LABEL.to_string(), machine_label)]),
        ),
        type_: Some(MACHINE_PLAN_SECRET_TYPE.to_string()),
        ..Default::default()
    };

    let role = Role {
        metadata: meta(&namespace, &name, BTreeMap::new()),
        rules: Some(vec![PolicyRule {
            verbs: PLAN_SECRET_VERBS.iter().map(|v| v.to_string()).collect(),
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![name.clone()]),
            ..Default::default()
        }]),
    };

    let role_binding = RoleBinding {
        metadata: meta(&namespace, &name, BTreeMap::new()),
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            namespace: Some(namespace.clone()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name,
        },
    };

    vec![
        service_account.into(),
        secret.into(),
        role.into(),
        role_binding.into(),
    ]
}

// =============================================================================
// Bootstrap channel
// =============================================================================

/// Output of the bootstrap channel for one machine
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BootstrapChannel {
    /// Computed bootstrap secret, once the principal's token exists
    pub secret: Option<Secret>,
    /// Principal objects to declare
    pub objects: Vec<DesiredObject>,
}

fn bootstrap_principal(machine: &Machine) -> ServiceAccount {
    let machine_name = machine.name_any();
    ServiceAccount {
        metadata: ObjectMeta {
            annotations: machine_annotation(&machine_name),
            ..meta(
                &machine.namespace().unwrap_or_default(),
                &bootstrap_principal_name(&machine_name),
                BTreeMap::from([
                    (MACHINE_NAME_LABEL.to_string(), safe_label_value(&machine_name)),
                    (ROLE_LABEL.to_string(), ROLE_BOOTSTRAP.to_string()),
                ]),
            )
        },
        ..Default::default()
    }
}

/// Bootstrap principal and payload for a machine that is still joining.
///
/// Empty unless the machine's configRef is an `RKEBootstrap` and its phase
/// still needs bootstrap data. Once the payload resolves, the RKEBootstrap
/// status is pointed at it, skipping the write when it already does.
pub async fn bootstrap_channel(machine: &Machine, ctx: &Context) -> Result<BootstrapChannel> {
    let Some(config_ref) = machine.rke_bootstrap_ref() else {
        return Ok(BootstrapChannel::default());
    };

    let phase = machine.phase();
    if !phase.needs_bootstrap() {
        debug!(%phase, "machine past bootstrap");
        return Ok(BootstrapChannel::default());
    }

    let principal = bootstrap_principal(machine);
    let namespace = machine.namespace().unwrap_or_default();
    let principal_name = principal.metadata.name.clone().unwrap_or_default();

    let secret = ctx.bootstrap.resolve(&namespace, &principal_name).await?;

    if let Some(secret) = &secret {
        let config_name = config_ref.name.as_deref().unwrap_or_default();
        let config = ctx.kube.get_rke_bootstrap(&namespace, config_name).await?;

        if !config.points_at(&principal_name) {
            let status = RKEBootstrapStatus {
                ready: true,
                data_secret_name: secret.metadata.name.clone(),
            };
            ctx.kube.update_rke_bootstrap_status(&config, &status).await?;
            info!(rke_bootstrap = %config_name, secret = %principal_name, "bootstrap data ready");
        }
    }

    Ok(BootstrapChannel {
        secret,
        objects: vec![principal.into()],
    })
}

// =============================================================================
// Machine reconciler
// =============================================================================

/// Full desired object set for a machine.
///
/// Machines of clusters not backed by an `RKECluster` get an empty set. The
/// status is passed through unchanged.
pub async fn on_change(
    machine: &Machine,
    status: MachineStatus,
    ctx: &Context,
) -> Result<(Vec<DesiredObject>, MachineStatus)> {
    let namespace = machine.namespace().unwrap_or_default();
    let cluster = ctx
        .kube
        .get_cluster(&namespace, &machine.spec.cluster_name)
        .await?;

    if !cluster.spec.is_rke_cluster() {
        debug!(cluster = %machine.spec.cluster_name, "cluster is not RKE-managed");
        return Ok((Vec::new(), status));
    }

    let mut objects = plan_channel_objects(machine);

    let bootstrap = bootstrap_channel(machine, ctx).await?;
    if let Some(secret) = bootstrap.secret {
        objects.push(secret.into());
    }
    objects.extend(bootstrap.objects);

    Ok((objects, status))
}

// =============================================================================
// Related-resource trigger
// =============================================================================

/// Machine to reconcile when a service account changes
///
/// Service accounts generated for a machine carry [`MACHINE_NAME_LABEL`] and
/// the full machine name in [`MACHINE_NAME_ANNOTATION`]. The label value is
/// used when the annotation is missing. Anything unlabelled maps to nothing.
pub fn machine_for_service_account(sa: &ServiceAccount) -> Option<ObjectRef<Machine>> {
    let label = sa.labels().get(MACHINE_NAME_LABEL)?;
    let machine = sa.annotations().get(MACHINE_NAME_ANNOTATION).unwrap_or(label);
    let namespace = sa.namespace().unwrap_or_default();
    Some(ObjectRef::new(machine).within(&namespace))
}

// =============================================================================
// Controller entry points
// =============================================================================

fn has_finalizer(machine: &Machine) -> bool {
    machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER)
}

/// Reconcile a CAPI Machine
///
/// Declares the machine's plan and bootstrap channels and prunes whatever it
/// no longer needs. Once only our finalizer holds a deleted machine, all
/// generated objects are removed and the finalizer released.
#[instrument(
    skip(machine, ctx),
    fields(machine = %machine.name_any(), namespace = %machine.namespace().unwrap_or_default())
)]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let owner = OwnerKey::new(machine.namespace().unwrap_or_default(), machine.name_any());
    let deleting = machine.metadata.deletion_timestamp.is_some();

    if deleting {
        if !has_finalizer(&machine) {
            ctx.apply.forget(&owner);
            return Ok(Action::await_change());
        }
        if machine.finalizers().len() == 1 {
            let summary = ctx.apply.apply(&owner, Vec::new()).await?;
            ctx.kube.remove_finalizer(&machine).await?;
            ctx.apply.forget(&owner);
            info!(pruned = summary.pruned, "released deleted machine");
            return Ok(Action::await_change());
        }
    }

    let status = machine.status.clone().unwrap_or_default();
    let (objects, _status) = on_change(&machine, status, &ctx).await?;

    if !objects.is_empty() && !deleting && !has_finalizer(&machine) {
        ctx.kube.add_finalizer(&machine).await?;
        debug!("added finalizer");
    }

    let summary = ctx.apply.apply(&owner, objects).await?;
    info!(
        applied = summary.applied,
        pruned = summary.pruned,
        phase = %machine.phase(),
        "reconciled machine"
    );

    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Logs the error and requeues. Missing dependencies usually mean the cache
/// has not caught up yet, so they wait longer.
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        machine = %machine.name_any(),
        namespace = %machine.namespace().unwrap_or_default(),
        "reconciliation failed"
    );

    if error.is_not_found() {
        Action::requeue(Duration::from_secs(15))
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}
