//! Volume, mount and claim-template derivation

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, PersistentVolumeClaim, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use emqx_common::crd::{DbRole, EmqxCluster};

use super::config::{BOOTSTRAP_CONFIG_KEY, LICENSE_KEY};
use super::owner_references;

/// Data directory inside the broker container
pub const DATA_MOUNT_PATH: &str = "/opt/emqx/data";
/// Log directory inside the broker container
pub const LOG_MOUNT_PATH: &str = "/opt/emqx/log";
/// Bootstrap configuration file inside the broker container
pub const BOOTSTRAP_CONFIG_MOUNT_PATH: &str = "/opt/emqx/etc/emqx.conf";
/// License file inside the broker container
pub const LICENSE_MOUNT_PATH: &str = "/opt/emqx/etc/emqx.lic";

const READ_WRITE_ONCE: &str = "ReadWriteOnce";

/// Volumes, mounts and claim templates for one node group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeSet {
    /// Pod volumes
    pub volumes: Vec<Volume>,
    /// Broker container mounts
    pub mounts: Vec<VolumeMount>,
    /// StatefulSet claim templates, empty unless the group is persistent
    pub claim_templates: Vec<PersistentVolumeClaim>,
}

/// Derive storage and configuration mounts for a node group
///
/// Data and log are always mounted. Core members get one claim template each
/// when storage is declared; everything else falls back to `emptyDir`.
pub fn compile_volumes(cluster: &EmqxCluster, role: DbRole) -> VolumeSet {
    let mut set = VolumeSet::default();
    let persistent = role == DbRole::Core && cluster.spec.storage.is_some();

    for (name, path) in [
        (cluster.data_volume_name(), DATA_MOUNT_PATH),
        (cluster.log_volume_name(), LOG_MOUNT_PATH),
    ] {
        if persistent {
            set.claim_templates.push(claim_template(cluster, &name));
        } else {
            set.volumes.push(Volume {
                name: name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
        set.mounts.push(mount(&name, path, None));
    }

    let bootstrap = cluster.bootstrap_config_name();
    set.volumes.push(config_map_volume(&bootstrap));
    set.mounts.push(mount(
        &bootstrap,
        BOOTSTRAP_CONFIG_MOUNT_PATH,
        Some(BOOTSTRAP_CONFIG_KEY),
    ));

    for bundle in cluster.spec.bundles() {
        let name = cluster.bundle_config_map_name(bundle);
        set.volumes.push(config_map_volume(&name));
        set.mounts
            .push(mount(&name, &bundle.mount_path, Some(&bundle.sub_path)));
    }

    if cluster.spec.license_payload().is_some() {
        let name = cluster.license_secret_name();
        set.volumes.push(Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        set.mounts
            .push(mount(&name, LICENSE_MOUNT_PATH, Some(LICENSE_KEY)));
    }

    set
}

fn claim_template(cluster: &EmqxCluster, name: &str) -> PersistentVolumeClaim {
    let mut spec = cluster
        .spec
        .storage
        .as_ref()
        .map(|s| s.volume_claim_template.clone())
        .unwrap_or_default();
    if spec.access_modes.as_ref().map_or(true, Vec::is_empty) {
        spec.access_modes = Some(vec![READ_WRITE_ONCE.to_string()]);
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(cluster.namespace_or_default()),
            labels: Some(cluster.role_selector_labels(DbRole::Core)),
            owner_references: owner_references(cluster),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

fn config_map_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tests::sample_cluster;
    use emqx_common::crd::{Edition, StorageSpec};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    fn mount_paths(set: &VolumeSet) -> Vec<&str> {
        set.mounts.iter().map(|m| m.mount_path.as_str()).collect()
    }

    #[test]
    fn without_storage_data_and_log_are_ephemeral() {
        let cluster = sample_cluster("broker");
        let set = compile_volumes(&cluster, DbRole::Core);

        assert!(set.claim_templates.is_empty());
        let data = set
            .volumes
            .iter()
            .find(|v| v.name == "broker-data")
            .unwrap();
        assert!(data.empty_dir.is_some());
        assert!(mount_paths(&set).contains(&DATA_MOUNT_PATH));
        assert!(mount_paths(&set).contains(&LOG_MOUNT_PATH));
    }

    #[test]
    fn storage_yields_exactly_two_claims_with_default_access_mode() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.storage = Some(StorageSpec::default());

        let set = compile_volumes(&cluster, DbRole::Core);

        assert_eq!(set.claim_templates.len(), 2);
        for claim in &set.claim_templates {
            let spec = claim.spec.as_ref().unwrap();
            assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
            let owners = claim.metadata.owner_references.as_ref().unwrap();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].controller, Some(true));
            assert_eq!(owners[0].block_owner_deletion, Some(true));
            assert_eq!(owners[0].kind, "EmqxCluster");
        }
        assert!(!set.volumes.iter().any(|v| v.name == "broker-data"));
        assert!(mount_paths(&set).contains(&DATA_MOUNT_PATH));
    }

    #[test]
    fn declared_access_mode_is_kept() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.storage = Some(StorageSpec {
            volume_claim_template: PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                storage_class_name: Some("fast".to_string()),
                ..Default::default()
            },
        });

        let set = compile_volumes(&cluster, DbRole::Core);

        for claim in &set.claim_templates {
            let spec = claim.spec.as_ref().unwrap();
            assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
            assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        }
    }

    #[test]
    fn replicants_stay_ephemeral_with_storage() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.storage = Some(StorageSpec::default());

        let set = compile_volumes(&cluster, DbRole::Replicant);

        assert!(set.claim_templates.is_empty());
        assert!(set
            .volumes
            .iter()
            .any(|v| v.name == "broker-log" && v.empty_dir.is_some()));
    }

    #[test]
    fn bundles_are_mounted_at_declared_paths() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.acl.mount_path = "/custom/acl.conf".to_string();

        let set = compile_volumes(&cluster, DbRole::Core);

        let acl = set
            .mounts
            .iter()
            .find(|m| m.name == "broker-acl")
            .unwrap();
        assert_eq!(acl.mount_path, "/custom/acl.conf");
        assert_eq!(acl.sub_path.as_deref(), Some("acl.conf"));
        assert!(set.mounts.iter().any(|m| m.name == "broker-loaded-modules"));
        assert!(set.mounts.iter().any(|m| m.name == "broker-loaded-plugins"));
        assert!(mount_paths(&set).contains(&BOOTSTRAP_CONFIG_MOUNT_PATH));
    }

    #[test]
    fn license_is_mounted_only_when_present() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.edition = Edition::Enterprise;
        assert!(!mount_paths(&compile_volumes(&cluster, DbRole::Core)).contains(&LICENSE_MOUNT_PATH));

        cluster.spec.license = Some(String::new());
        assert!(!mount_paths(&compile_volumes(&cluster, DbRole::Core)).contains(&LICENSE_MOUNT_PATH));

        cluster.spec.license = Some("LICENSE-KEY".to_string());
        let set = compile_volumes(&cluster, DbRole::Replicant);
        let license = set
            .mounts
            .iter()
            .find(|m| m.mount_path == LICENSE_MOUNT_PATH)
            .unwrap();
        assert_eq!(license.sub_path.as_deref(), Some(LICENSE_KEY));
    }
}
