//! Core StatefulSet and replicant Deployment

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PodReadinessGate,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use emqx_common::crd::{DbRole, EmqxCluster};
use emqx_common::ON_SERVING_CONDITION;

use super::object_meta;
use super::ports::{env_var, merge_env, ListenerPortSet};
use super::volumes::{compile_volumes, VolumeSet};

/// Name of the broker container in every pod
pub const BROKER_CONTAINER: &str = "emqx";

const BROKER_UID: i64 = 1000;
const POD_NAME_ENV: &str = "POD_NAME";

/// Core members: a StatefulSet with stable identities behind the headless service
pub fn compile_core(cluster: &EmqxCluster, ports: &ListenerPortSet) -> StatefulSet {
    let VolumeSet {
        volumes,
        mounts,
        claim_templates,
    } = compile_volumes(cluster, DbRole::Core);

    StatefulSet {
        metadata: object_meta(
            cluster,
            cluster.workload_name(DbRole::Core),
            Some(DbRole::Core),
        ),
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.desired_replicas(DbRole::Core)),
            service_name: cluster.headless_service_name(),
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(cluster.role_selector_labels(DbRole::Core)),
                ..Default::default()
            },
            template: pod_template(
                cluster,
                DbRole::Core,
                ports,
                PodVolumes { volumes, mounts },
            ),
            volume_claim_templates: (!claim_templates.is_empty()).then_some(claim_templates),
            ..Default::default()
        }),
        status: None,
    }
}

/// Replicants: a Deployment of interchangeable, ephemeral members
pub fn compile_replicant(cluster: &EmqxCluster, ports: &ListenerPortSet) -> Deployment {
    let VolumeSet {
        volumes, mounts, ..
    } = compile_volumes(cluster, DbRole::Replicant);

    Deployment {
        metadata: object_meta(
            cluster,
            cluster.workload_name(DbRole::Replicant),
            Some(DbRole::Replicant),
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(cluster.desired_replicas(DbRole::Replicant)),
            selector: LabelSelector {
                match_labels: Some(cluster.role_selector_labels(DbRole::Replicant)),
                ..Default::default()
            },
            template: pod_template(
                cluster,
                DbRole::Replicant,
                ports,
                PodVolumes { volumes, mounts },
            ),
            ..Default::default()
        }),
        status: None,
    }
}

struct PodVolumes {
    volumes: Vec<k8s_openapi::api::core::v1::Volume>,
    mounts: Vec<k8s_openapi::api::core::v1::VolumeMount>,
}

fn pod_template(
    cluster: &EmqxCluster,
    role: DbRole,
    ports: &ListenerPortSet,
    storage: PodVolumes,
) -> PodTemplateSpec {
    let template = cluster.template(role);

    // Selector labels are applied last so user labels can never break selection.
    let mut labels = template.labels.clone();
    labels.extend(cluster.role_selector_labels(role));

    let base_env = [cluster_env(cluster, role), ports.env.clone()].concat();
    let env = merge_env(&base_env, &template.env);

    let readiness_probe = (cluster.spec.listener.ports.dashboard != 0).then(|| Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/status".to_string()),
            port: IntOrString::Int(i32::from(cluster.spec.listener.ports.dashboard)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(5),
        failure_threshold: Some(12),
        ..Default::default()
    });

    let container = Container {
        name: BROKER_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        image_pull_policy: Some(cluster.spec.image_pull_policy.clone()),
        ports: (!ports.container_ports.is_empty()).then(|| ports.container_ports.clone()),
        env: Some(env),
        resources: template.resources.clone(),
        volume_mounts: Some(storage.mounts),
        readiness_probe,
        ..Default::default()
    };

    // Deployment pods only resolve through the headless service when their
    // subdomain names it; StatefulSet pods get this from serviceName.
    let subdomain = (role == DbRole::Replicant).then(|| cluster.headless_service_name());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: (!template.annotations.is_empty()).then(|| template.annotations.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(storage.volumes),
            readiness_gates: Some(vec![PodReadinessGate {
                condition_type: ON_SERVING_CONDITION.to_string(),
            }]),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(BROKER_UID),
                run_as_group: Some(BROKER_UID),
                fs_group: Some(BROKER_UID),
                fs_group_change_policy: Some("Always".to_string()),
                ..Default::default()
            }),
            service_account_name: cluster.spec.service_account_name.clone(),
            node_selector: (!template.node_selector.is_empty())
                .then(|| template.node_selector.clone()),
            tolerations: (!template.tolerations.is_empty()).then(|| template.tolerations.clone()),
            subdomain,
            ..Default::default()
        }),
    }
}

/// Identity and discovery environment, ahead of the listener overrides
fn cluster_env(cluster: &EmqxCluster, role: DbRole) -> Vec<EnvVar> {
    let headless_fqdn = format!(
        "{}.{}.svc.cluster.local",
        cluster.headless_service_name(),
        cluster.namespace_or_default()
    );
    vec![
        EnvVar {
            name: POD_NAME_ENV.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        },
        env_var("EMQX_HOST", format!("$({POD_NAME_ENV}).{headless_fqdn}")),
        env_var("EMQX_NODE__DB_ROLE", role.as_str()),
        env_var("EMQX_CLUSTER__DISCOVERY_STRATEGY", "dns"),
        env_var("EMQX_CLUSTER__DNS__NAME", headless_fqdn),
        env_var("EMQX_CLUSTER__DNS__RECORD_TYPE", "srv"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ports::compile_ports;
    use crate::compiler::tests::sample_cluster;
    use emqx_common::crd::StorageSpec;

    fn container(template: &PodTemplateSpec) -> &Container {
        &template.spec.as_ref().unwrap().containers[0]
    }

    fn env_value<'a>(c: &'a Container, name: &str) -> Option<&'a str> {
        c.env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn core_is_a_parallel_statefulset_behind_headless_service() {
        let cluster = sample_cluster("broker");
        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        let spec = sts.spec.as_ref().unwrap();

        assert_eq!(sts.metadata.name.as_deref(), Some("broker-core"));
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "broker-headless");
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        assert!(spec.volume_claim_templates.is_none());
    }

    #[test]
    fn core_with_storage_carries_claim_templates() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.storage = Some(StorageSpec::default());
        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        let claims = sts.spec.unwrap().volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn replicant_deployment_uses_headless_subdomain() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.replicant_template.replicas = Some(2);
        let ports = compile_ports(&cluster.spec.listener.ports);
        let deploy = compile_replicant(&cluster, &ports);
        let spec = deploy.spec.unwrap();

        assert_eq!(spec.replicas, Some(2));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.subdomain.as_deref(), Some("broker-headless"));
    }

    #[test]
    fn selector_labels_survive_user_labels() {
        let mut cluster = sample_cluster("broker");
        cluster
            .spec
            .core_template
            .labels
            .insert("apps.emqx.io/instance".to_string(), "hijack".to_string());
        cluster
            .spec
            .core_template
            .labels
            .insert("team".to_string(), "iot".to_string());

        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        let spec = sts.spec.unwrap();
        let labels = spec.template.metadata.unwrap().labels.unwrap();

        assert_eq!(labels["apps.emqx.io/instance"], "broker");
        assert_eq!(labels["apps.emqx.io/db-role"], "core");
        assert_eq!(labels["team"], "iot");
        assert_eq!(
            spec.selector.match_labels,
            Some(cluster.role_selector_labels(DbRole::Core))
        );
    }

    #[test]
    fn pods_gate_readiness_on_serving_condition() {
        let cluster = sample_cluster("broker");
        let ports = compile_ports(&cluster.spec.listener.ports);
        let deploy = compile_replicant(&cluster, &ports);
        let gates = deploy.spec.unwrap().template.spec.unwrap().readiness_gates.unwrap();
        assert_eq!(gates[0].condition_type, "OnServing");
    }

    #[test]
    fn template_env_overrides_listener_env() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.core_template.env = vec![
            env_var("EMQX_LISTENER__TCP__EXTERNAL", "0.0.0.0:1884"),
            env_var("EMQX_LOG__LEVEL", "debug"),
        ];
        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        let template = &sts.spec.as_ref().unwrap().template;
        let c = container(template);

        assert_eq!(
            env_value(c, "EMQX_LISTENER__TCP__EXTERNAL"),
            Some("0.0.0.0:1884")
        );
        assert_eq!(env_value(c, "EMQX_LOG__LEVEL"), Some("debug"));
        assert_eq!(env_value(c, "EMQX_NODE__DB_ROLE"), Some("core"));
        let count = c
            .env
            .as_ref()
            .unwrap()
            .iter()
            .filter(|e| e.name == "EMQX_LISTENER__TCP__EXTERNAL")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn pods_run_as_broker_user() {
        let cluster = sample_cluster("broker");
        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        let ctx = sts
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .security_context
            .unwrap();
        assert_eq!(ctx.run_as_user, Some(1000));
        assert_eq!(ctx.fs_group, Some(1000));
    }

    #[test]
    fn readiness_probe_follows_dashboard_port() {
        let mut cluster = sample_cluster("broker");
        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        assert!(container(&sts.spec.as_ref().unwrap().template)
            .readiness_probe
            .is_some());

        cluster.spec.listener.ports.dashboard = 0;
        let ports = compile_ports(&cluster.spec.listener.ports);
        let sts = compile_core(&cluster, &ports);
        assert!(container(&sts.spec.as_ref().unwrap().template)
            .readiness_probe
            .is_none());
    }
}
