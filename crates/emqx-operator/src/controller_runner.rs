//! Controller runner - builds the EmqxCluster controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use emqx_cluster::controller::{error_policy, reconcile, Context};
use emqx_common::crd::EmqxCluster;
use emqx_common::{LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGED_BY_VALUE};

use crate::config::OperatorConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Map a broker pod to the cluster named by its instance label
pub fn cluster_for_pod(pod: &Pod) -> Option<ObjectRef<EmqxCluster>> {
    let name = pod.labels().get(LABEL_INSTANCE)?;
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Build the EmqxCluster controller future
pub fn build_cluster_controller(
    client: Client,
    config: &OperatorConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config.reconcile_config())
            .api_timeout(config.api_timeout())
            .tunnel_timeout(config.tunnel_timeout())
            .build(),
    );

    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let managed = format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}");

    tracing::info!("- EmqxCluster controller");

    Box::pin(
        Controller::new(Api::<EmqxCluster>::all(client.clone()), watcher())
            .owns(Api::<StatefulSet>::all(client.clone()), watcher())
            .owns(Api::<Deployment>::all(client.clone()), watcher())
            .owns(Api::<Service>::all(client.clone()), watcher())
            .owns(Api::<ConfigMap>::all(client.clone()), watcher())
            .owns(Api::<Secret>::all(client.clone()), watcher())
            .watches(Api::<Pod>::all(client), watcher().labels(&managed), |pod| {
                cluster_for_pod(&pod)
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("EmqxCluster")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
