//! Per-pod `OnServing` condition synchronization
//!
//! A pod is judged only once it is both a broker member and platform-ready.
//! For editions with rebalance support the broker is asked, through a fresh
//! tunnel per pod, whether the node currently accepts new connections.
//!
//! Pods are processed in listing order. The first infrastructure failure
//! aborts the pass; patches already written stay written.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info};

use emqx_common::crd::{ConditionStatus, EmqxCluster};
use emqx_common::hocon::AdminCredentials;
use emqx_common::kube_utils::pod_containers_ready;
use emqx_common::{Error, ON_SERVING_CONDITION};

use crate::controller::KubeClient;
use crate::tunnel::{AdminRequest, BrokerAdmin, PodTarget};

const REASON_SERVING: &str = "Serving";
const REASON_REBALANCING: &str = "RebalanceInProgress";

/// Summary of one synchronization pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Pods whose condition was written
    pub written: Vec<String>,
    /// Listed pods the broker does not report as members
    pub not_members: usize,
    /// Member pods whose containers are not ready
    pub not_ready: usize,
}

/// Compute the next `OnServing` condition
///
/// The transition time is carried over from `existing` when the status is
/// unchanged; the probe time is always `now`.
pub fn on_serving_condition(
    existing: Option<&PodCondition>,
    status: ConditionStatus,
    now: DateTime<Utc>,
) -> PodCondition {
    let last_transition_time = match existing {
        Some(prev) if prev.status == status.as_str() && prev.last_transition_time.is_some() => {
            prev.last_transition_time.clone()
        }
        _ => Some(Time(now)),
    };

    let (reason, message) = match status {
        ConditionStatus::True => (REASON_SERVING, "pod is ready and accepting connections"),
        ConditionStatus::False => (
            REASON_REBALANCING,
            "broker reports the node unavailable for new connections",
        ),
        ConditionStatus::Unknown => ("Unknown", "serving state could not be determined"),
    };

    PodCondition {
        type_: ON_SERVING_CONDITION.to_string(),
        status: status.as_str().to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_probe_time: Some(Time(now)),
        last_transition_time,
    }
}

/// Existing `OnServing` condition on a pod, if any
pub fn existing_on_serving(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == ON_SERVING_CONDITION)
}

/// Ask the broker whether a node is available during rebalance
///
/// HTTP 200 means available. Any other status means unavailable, which is a
/// normal result. Tunnel and transport failures are returned as errors.
pub async fn check_rebalance(
    cluster: &EmqxCluster,
    pod: &str,
    admin: &dyn BrokerAdmin,
    api_version: &str,
    credentials: &AdminCredentials,
) -> Result<ConditionStatus, Error> {
    if !cluster.capabilities().rebalance_check {
        return Err(Error::invariant(
            cluster.name_any(),
            format!(
                "rebalance check invoked for edition {}",
                cluster.spec.edition
            ),
        ));
    }

    let target = PodTarget::new(cluster.namespace_or_default(), pod, cluster.admin_port());
    let request = AdminRequest::get(
        format!("/api/{api_version}/load_rebalance/availability_check"),
        credentials.clone(),
    );
    let response = admin.request(&target, &request).await?;

    Ok(if response.status == http::StatusCode::OK {
        ConditionStatus::True
    } else {
        debug!(pod, status = response.status.as_u16(), "node unavailable");
        ConditionStatus::False
    })
}

/// Cross-references pod readiness with broker membership and writes `OnServing`
pub struct PodConditionSynchronizer<'a> {
    kube: &'a dyn KubeClient,
    admin: &'a dyn BrokerAdmin,
    api_version: &'a str,
}

impl<'a> PodConditionSynchronizer<'a> {
    /// Create a synchronizer over the given clients
    pub fn new(kube: &'a dyn KubeClient, admin: &'a dyn BrokerAdmin, api_version: &'a str) -> Self {
        Self {
            kube,
            admin,
            api_version,
        }
    }

    /// Run one pass over `pods`
    pub async fn sync(
        &self,
        cluster: &EmqxCluster,
        pods: &[Pod],
        members: &HashSet<String>,
        credentials: &AdminCredentials,
    ) -> Result<SyncReport, Error> {
        let namespace = cluster.namespace_or_default();
        let check_rebalance_enabled = cluster.capabilities().rebalance_check;
        let mut report = SyncReport::default();

        for pod in pods {
            let name = pod.name_any();
            if !members.contains(&name) {
                debug!(pod = %name, "not a broker member yet, skipping");
                report.not_members += 1;
                continue;
            }
            if !pod_containers_ready(pod) {
                debug!(pod = %name, "containers not ready, skipping");
                report.not_ready += 1;
                continue;
            }

            let status = if check_rebalance_enabled {
                check_rebalance(cluster, &name, self.admin, self.api_version, credentials).await?
            } else {
                ConditionStatus::True
            };

            let existing = existing_on_serving(pod);
            let condition = on_serving_condition(existing, status, Utc::now());
            if existing.map(|c| c.status.as_str()) != Some(condition.status.as_str()) {
                info!(pod = %name, status = %condition.status, "OnServing changed");
            }

            self.kube
                .patch_pod_condition(&namespace, &name, &condition)
                .await
                .map_err(|e| Error::pod_condition(&name, e))?;
            report.written.push(name);
        }

        Ok(report)
    }
}
