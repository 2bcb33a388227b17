//! EmqxCluster controller implementation
//!
//! Each pass runs a fixed pipeline of steps against one cluster:
//!
//! 1. `apply-resources`: compile the desired object set and server-side apply it
//! 2. `sync-broker-nodes`: read broker membership through a ready core pod
//! 3. `sync-pod-conditions`: write `OnServing` on every member pod
//! 4. `update-status`: aggregate workload readiness into the cluster status
//!
//! The first failing step ends the pass and its error goes to [`error_policy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use emqx_common::crd::{EmqxCluster, EmqxClusterStatus, EmqxNode};
use emqx_common::hocon::{AdminCredentials, ConfigDocument};
use emqx_common::kube_utils::{merge_patch_status, with_timeout, ApplyBatch};
use emqx_common::{Error, FIELD_MANAGER};

use crate::compiler::{compile, CompiledCluster};
use crate::conditions::PodConditionSynchronizer;
use crate::nodes::{member_pod_names, query_membership, MembershipQuery};
use crate::status::UpdateStatus;
use crate::tunnel::{BrokerAdmin, PortForwardAdmin, DEFAULT_TUNNEL_TIMEOUT};

/// Default admin REST API version
pub const DEFAULT_ADMIN_API_VERSION: &str = "v5";

/// Trait abstracting the Kubernetes operations the controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Server-side apply every object of a compiled cluster, returning how many were applied
    async fn apply_resources(
        &self,
        namespace: &str,
        compiled: &CompiledCluster,
    ) -> Result<usize, Error>;

    /// List pods in `namespace` matching `label_selector`
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Patch a single condition onto a pod's status
    async fn patch_pod_condition(
        &self,
        namespace: &str,
        pod: &str,
        condition: &PodCondition,
    ) -> Result<(), Error>;

    /// Get the core StatefulSet if it exists
    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error>;

    /// Get the replicant Deployment if it exists
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Merge-patch the status of an EmqxCluster
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EmqxClusterStatus,
    ) -> Result<(), Error>;

    /// Replace only the broker membership recorded in an EmqxCluster's status
    async fn patch_members(
        &self,
        namespace: &str,
        name: &str,
        members: &[EmqxNode],
    ) -> Result<(), Error>;
}

/// Status body for a merge patch
///
/// `emqxNodes` is always written so an empty membership clears the stored list.
pub fn status_patch_body(status: &EmqxClusterStatus) -> Result<serde_json::Value, Error> {
    let mut body = serde_json::to_value(status)?;
    if let Some(fields) = body.as_object_mut() {
        fields.insert("emqxNodes".to_string(), serde_json::to_value(&status.emqx_nodes)?);
    }
    Ok(body)
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    timeout: Duration,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl bounding every call by `timeout`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn apply_resources(
        &self,
        namespace: &str,
        compiled: &CompiledCluster,
    ) -> Result<usize, Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut batch = ApplyBatch::new(self.client.clone(), namespace, &params);

        batch.push(&compiled.headless_service)?;
        batch.push(&compiled.listener_service)?;
        for config_map in &compiled.config_maps {
            batch.push(config_map)?;
        }
        if let Some(secret) = &compiled.license_secret {
            batch.push(secret)?;
        }
        batch.push(&compiled.core)?;
        batch.push(&compiled.replicant)?;

        with_timeout(self.timeout, "apply_resources", batch.run("cluster")).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        with_timeout(self.timeout, "list_pods", async {
            Ok::<_, Error>(api.list(&params).await?.items)
        })
        .await
    }

    async fn patch_pod_condition(
        &self,
        namespace: &str,
        pod: &str,
        condition: &PodCondition,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        // Strategic merge keys pod conditions by type, leaving the others intact
        let patch = json!({ "status": { "conditions": [condition] } });
        with_timeout(self.timeout, "patch_pod_condition", async {
            api.patch_status(pod, &PatchParams::default(), &Patch::Strategic(&patch))
                .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        with_timeout(self.timeout, "get_statefulset", async {
            Ok::<_, Error>(api.get_opt(name).await?)
        })
        .await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        with_timeout(self.timeout, "get_deployment", async {
            Ok::<_, Error>(api.get_opt(name).await?)
        })
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EmqxClusterStatus,
    ) -> Result<(), Error> {
        let api: Api<EmqxCluster> = Api::namespaced(self.client.clone(), namespace);
        let body = status_patch_body(status)?;
        with_timeout(
            self.timeout,
            "patch_status",
            merge_patch_status(&api, name, body, FIELD_MANAGER),
        )
        .await
    }

    async fn patch_members(
        &self,
        namespace: &str,
        name: &str,
        members: &[EmqxNode],
    ) -> Result<(), Error> {
        let api: Api<EmqxCluster> = Api::namespaced(self.client.clone(), namespace);
        let body = json!({ "emqxNodes": members });
        with_timeout(
            self.timeout,
            "patch_members",
            merge_patch_status(&api, name, body, FIELD_MANAGER),
        )
        .await
    }
}

/// Tunables for a reconcile pass
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// Admin REST API version segment, e.g. `v5`
    pub admin_api_version: String,
    /// Periodic resync after a successful pass
    pub requeue_interval: Duration,
    /// Requeue used while broker membership cannot be read
    pub membership_requeue: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            admin_api_version: DEFAULT_ADMIN_API_VERSION.to_string(),
            requeue_interval: Duration::from_secs(60),
            membership_requeue: Duration::from_secs(10),
        }
    }
}

/// Controller context containing shared state and clients
pub struct Context {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn KubeClient>,
    /// Broker admin API client
    pub admin: Arc<dyn BrokerAdmin>,
    /// Reconcile tunables
    pub config: ReconcileConfig,
}

impl Context {
    /// Create a builder seeded with a Kubernetes client
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, admin: Arc<dyn BrokerAdmin>) -> Self {
        Self {
            kube,
            admin,
            config: ReconcileConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    admin: Option<Arc<dyn BrokerAdmin>>,
    config: ReconcileConfig,
    api_timeout: Duration,
    tunnel_timeout: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            admin: None,
            config: ReconcileConfig::default(),
            api_timeout: Duration::from_secs(30),
            tunnel_timeout: DEFAULT_TUNNEL_TIMEOUT,
        }
    }

    /// Override the Kubernetes client implementation
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the broker admin implementation
    pub fn broker_admin(mut self, admin: Arc<dyn BrokerAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Set reconcile tunables
    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound each Kubernetes API call
    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    /// Bound tunnel establishment and each admin call
    pub fn tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_timeout = timeout;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone(), self.api_timeout)));
        let admin = self
            .admin
            .unwrap_or_else(|| Arc::new(PortForwardAdmin::new(self.client, self.tunnel_timeout)));
        Context {
            kube,
            admin,
            config: self.config,
        }
    }
}

/// Working state threaded through one reconcile pass
#[derive(Debug)]
pub struct ReconcileState {
    /// Admin credentials read from the bootstrap configuration
    pub credentials: AdminCredentials,
    /// Broker membership, seeded from the stored status
    pub members: Vec<EmqxNode>,
    pods: Option<Vec<Pod>>,
}

impl ReconcileState {
    /// Seed the state from a cluster's spec and last stored status
    pub fn new(cluster: &EmqxCluster) -> Result<Self, Error> {
        let credentials = ConfigDocument::parse(&cluster.spec.bootstrap_config)?.admin_credentials();
        let members = cluster
            .status
            .as_ref()
            .map(|s| s.emqx_nodes.clone())
            .unwrap_or_default();
        Ok(Self {
            credentials,
            members,
            pods: None,
        })
    }

    /// Pods of the cluster, listed once per pass
    pub async fn pods(&mut self, cluster: &EmqxCluster, ctx: &Context) -> Result<&[Pod], Error> {
        if self.pods.is_none() {
            let pods = ctx
                .kube
                .list_pods(&cluster.namespace_or_default(), &cluster.label_selector())
                .await?;
            debug!(count = pods.len(), "listed cluster pods");
            self.pods = Some(pods);
        }
        Ok(self.pods.as_deref().unwrap_or_default())
    }
}

/// Outcome of one successful step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepResult {
    /// Requeue no later than this
    pub requeue_after: Option<Duration>,
    /// Do not run the steps after this one
    pub skip_remaining: bool,
}

impl StepResult {
    /// Step finished, continue
    pub fn done() -> Self {
        Self::default()
    }

    /// Step finished and wants another pass within `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            skip_remaining: false,
        }
    }

    /// Step finished and the rest of the pipeline should not run
    pub fn stop() -> Self {
        Self {
            requeue_after: None,
            skip_remaining: true,
        }
    }
}

/// One idempotent step of the reconcile pipeline
#[async_trait]
pub trait SubReconciler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Run the step
    async fn reconcile(
        &self,
        cluster: &EmqxCluster,
        state: &mut ReconcileState,
        ctx: &Context,
    ) -> Result<StepResult, Error>;
}

/// Compiles the desired object set and applies it
pub struct ApplyResources;

#[async_trait]
impl SubReconciler for ApplyResources {
    fn name(&self) -> &'static str {
        "apply-resources"
    }

    async fn reconcile(
        &self,
        cluster: &EmqxCluster,
        _state: &mut ReconcileState,
        ctx: &Context,
    ) -> Result<StepResult, Error> {
        let compiled = compile(cluster);
        let applied = ctx
            .kube
            .apply_resources(&cluster.namespace_or_default(), &compiled)
            .await?;
        debug!(applied, "desired state applied");
        Ok(StepResult::done())
    }
}

/// Refreshes broker membership and records it in the status
pub struct SyncBrokerNodes;

#[async_trait]
impl SubReconciler for SyncBrokerNodes {
    fn name(&self) -> &'static str {
        "sync-broker-nodes"
    }

    async fn reconcile(
        &self,
        cluster: &EmqxCluster,
        state: &mut ReconcileState,
        ctx: &Context,
    ) -> Result<StepResult, Error> {
        let credentials = state.credentials.clone();
        let pods = state.pods(cluster, ctx).await?;
        let query = query_membership(
            cluster,
            pods,
            ctx.admin.as_ref(),
            &ctx.config.admin_api_version,
            &credentials,
        )
        .await?;

        let nodes = match query {
            MembershipQuery::Members(nodes) => nodes,
            MembershipQuery::NoReadyCore | MembershipQuery::Unavailable(_) => {
                return Ok(StepResult::requeue_after(ctx.config.membership_requeue));
            }
        };

        if nodes != state.members {
            info!(members = nodes.len(), "broker membership changed");
            ctx.kube
                .patch_members(&cluster.namespace_or_default(), &cluster.name_any(), &nodes)
                .await?;
        }
        state.members = nodes;
        Ok(StepResult::done())
    }
}

/// Writes `OnServing` on every member pod
pub struct SyncPodConditions;

#[async_trait]
impl SubReconciler for SyncPodConditions {
    fn name(&self) -> &'static str {
        "sync-pod-conditions"
    }

    async fn reconcile(
        &self,
        cluster: &EmqxCluster,
        state: &mut ReconcileState,
        ctx: &Context,
    ) -> Result<StepResult, Error> {
        let members = member_pod_names(&state.members);
        let credentials = state.credentials.clone();
        let pods = state.pods(cluster, ctx).await?;

        let synchronizer = PodConditionSynchronizer::new(
            ctx.kube.as_ref(),
            ctx.admin.as_ref(),
            &ctx.config.admin_api_version,
        );
        let report = synchronizer
            .sync(cluster, pods, &members, &credentials)
            .await?;
        debug!(
            written = report.written.len(),
            not_members = report.not_members,
            not_ready = report.not_ready,
            "pod conditions synchronized"
        );
        Ok(StepResult::done())
    }
}

/// Ordered list of steps run for each cluster
pub struct Pipeline {
    steps: Vec<Box<dyn SubReconciler>>,
}

impl Pipeline {
    /// Build a pipeline from explicit steps
    pub fn new(steps: Vec<Box<dyn SubReconciler>>) -> Self {
        Self { steps }
    }

    /// The production pipeline
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(ApplyResources),
            Box::new(SyncBrokerNodes),
            Box::new(SyncPodConditions),
            Box::new(UpdateStatus),
        ])
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping at the first error
    ///
    /// The returned action requeues at the earliest delay any step asked for,
    /// bounded by the periodic resync interval.
    pub async fn run(&self, cluster: &EmqxCluster, ctx: &Context) -> Result<Action, Error> {
        let mut state = ReconcileState::new(cluster)?;
        let mut requeue = ctx.config.requeue_interval;

        for step in &self.steps {
            let result = match step.reconcile(cluster, &mut state, ctx).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(step = step.name(), error = %e, "step failed");
                    return Err(e);
                }
            };
            if let Some(delay) = result.requeue_after {
                requeue = requeue.min(delay);
            }
            if result.skip_remaining {
                debug!(step = step.name(), "skipping remaining steps");
                break;
            }
        }

        Ok(Action::requeue(requeue))
    }
}

/// Reconcile an EmqxCluster resource
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<EmqxCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, owned objects follow via garbage collection");
        return Ok(Action::await_change());
    }

    info!(generation = ?cluster.metadata.generation, "reconciling cluster");
    Pipeline::standard().run(&cluster, &ctx).await
}

/// Error policy for the controller
pub fn error_policy(cluster: Arc<EmqxCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
