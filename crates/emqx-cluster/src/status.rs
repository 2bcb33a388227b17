//! Cluster status aggregation

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::ResourceExt;
use tracing::{debug, info};

use emqx_common::crd::{
    ClusterPhase, Condition, ConditionStatus, DbRole, EmqxCluster, EmqxClusterStatus, EmqxNode,
};
use emqx_common::Error;

use crate::controller::{Context, ReconcileState, StepResult, SubReconciler};
use crate::nodes::extract_pod_name;

/// Cluster-level readiness condition type
pub const READY_CONDITION: &str = "Ready";

/// Ready replicas reported by the workloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadyReplicas {
    /// Ready core pods
    pub core: i32,
    /// Ready replicant pods
    pub replicant: i32,
}

impl ReadyReplicas {
    /// Read ready counts from whichever workloads exist
    pub fn observe(core: Option<&StatefulSet>, replicant: Option<&Deployment>) -> Self {
        Self {
            core: core
                .and_then(|s| s.status.as_ref())
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
            replicant: replicant
                .and_then(|d| d.status.as_ref())
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }
}

/// Core members the broker reports, counted by pod naming
fn core_member_count(cluster: &EmqxCluster, members: &[EmqxNode]) -> i32 {
    let prefix = format!("{}-", cluster.workload_name(DbRole::Core));
    let count = members
        .iter()
        .filter(|n| extract_pod_name(&n.node).starts_with(&prefix))
        .count();
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Derive the phase from workload readiness and broker membership
pub fn derive_phase(
    cluster: &EmqxCluster,
    workloads_exist: bool,
    ready: ReadyReplicas,
    members: &[EmqxNode],
) -> ClusterPhase {
    if !workloads_exist {
        return ClusterPhase::Pending;
    }
    if ready.core < cluster.desired_replicas(DbRole::Core)
        || ready.replicant < cluster.desired_replicas(DbRole::Replicant)
    {
        return ClusterPhase::Provisioning;
    }
    if core_member_count(cluster, members) < ready.core {
        return ClusterPhase::Degraded;
    }
    ClusterPhase::Running
}

/// Build the next status from what was observed this pass
pub fn compute_status(
    cluster: &EmqxCluster,
    core: Option<&StatefulSet>,
    replicant: Option<&Deployment>,
    members: &[EmqxNode],
) -> EmqxClusterStatus {
    let ready = ReadyReplicas::observe(core, replicant);
    let phase = derive_phase(
        cluster,
        core.is_some() || replicant.is_some(),
        ready,
        members,
    );

    let previous = cluster.status.as_ref();
    let previous_ready = previous.and_then(|s| s.conditions.iter().find(|c| c.type_ == READY_CONDITION));
    let (status, message) = match phase {
        ClusterPhase::Running => (ConditionStatus::True, "all members are ready and joined".to_string()),
        ClusterPhase::Pending => (ConditionStatus::False, "workloads not created yet".to_string()),
        ClusterPhase::Provisioning => (
            ConditionStatus::False,
            format!(
                "core {}/{}, replicant {}/{} ready",
                ready.core,
                cluster.desired_replicas(DbRole::Core),
                ready.replicant,
                cluster.desired_replicas(DbRole::Replicant)
            ),
        ),
        ClusterPhase::Degraded => (
            ConditionStatus::False,
            format!(
                "broker reports {} core members but {} core pods are ready",
                core_member_count(cluster, members),
                ready.core
            ),
        ),
    };
    let ready_condition = Condition::new(READY_CONDITION, status, phase.to_string(), message)
        .preserving_transition(previous_ready);

    let mut conditions: Vec<Condition> = previous
        .map(|s| {
            s.conditions
                .iter()
                .filter(|c| c.type_ != READY_CONDITION)
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    conditions.push(ready_condition);

    EmqxClusterStatus {
        observed_generation: cluster.metadata.generation,
        phase,
        conditions,
        emqx_nodes: members.to_vec(),
        core_ready_replicas: ready.core,
        replicant_ready_replicas: ready.replicant,
    }
}

/// True when writing `next` would change what is stored
pub fn status_changed(cluster: &EmqxCluster, next: &EmqxClusterStatus) -> bool {
    cluster.status.as_ref() != Some(next)
}

/// Writes the aggregated cluster status
pub struct UpdateStatus;

#[async_trait]
impl SubReconciler for UpdateStatus {
    fn name(&self) -> &'static str {
        "update-status"
    }

    async fn reconcile(
        &self,
        cluster: &EmqxCluster,
        state: &mut ReconcileState,
        ctx: &Context,
    ) -> Result<StepResult, Error> {
        let namespace = cluster.namespace_or_default();
        let core = ctx
            .kube
            .get_statefulset(&namespace, &cluster.workload_name(DbRole::Core))
            .await?;
        let replicant = ctx
            .kube
            .get_deployment(&namespace, &cluster.workload_name(DbRole::Replicant))
            .await?;

        let next = compute_status(cluster, core.as_ref(), replicant.as_ref(), &state.members);
        if !status_changed(cluster, &next) {
            debug!("status unchanged");
            return Ok(StepResult::done());
        }

        let previous_phase = cluster.status.as_ref().map(|s| s.phase.clone());
        if previous_phase.as_ref() != Some(&next.phase) {
            info!(phase = %next.phase, "cluster phase changed");
        }
        ctx.kube
            .patch_status(&namespace, &cluster.name_any(), &next)
            .await?;
        Ok(StepResult::done())
    }
}
