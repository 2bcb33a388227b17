//! Configuration bundles and the license secret

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};

use emqx_common::crd::EmqxCluster;

use super::object_meta;

/// Key of the bootstrap document inside its ConfigMap
pub const BOOTSTRAP_CONFIG_KEY: &str = "emqx.conf";
/// Key of the license payload inside its Secret
pub const LICENSE_KEY: &str = "emqx.lic";

/// ConfigMaps for the bootstrap document and each bundle, in mount order
pub fn compile_config_maps(cluster: &EmqxCluster) -> Vec<ConfigMap> {
    let mut maps = vec![ConfigMap {
        metadata: object_meta(cluster, cluster.bootstrap_config_name(), None),
        data: Some(BTreeMap::from([(
            BOOTSTRAP_CONFIG_KEY.to_string(),
            cluster.spec.bootstrap_config.clone(),
        )])),
        ..Default::default()
    }];

    maps.extend(cluster.spec.bundles().into_iter().map(|bundle| ConfigMap {
        metadata: object_meta(cluster, cluster.bundle_config_map_name(bundle), None),
        data: Some(BTreeMap::from([(
            bundle.sub_path.clone(),
            bundle.content.clone(),
        )])),
        ..Default::default()
    }));

    maps
}

/// License secret, only when a non-empty payload is declared
pub fn compile_license_secret(cluster: &EmqxCluster) -> Option<Secret> {
    let payload = cluster.spec.license_payload()?;
    Some(Secret {
        metadata: object_meta(cluster, cluster.license_secret_name(), None),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            LICENSE_KEY.to_string(),
            payload.to_string(),
        )])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tests::sample_cluster;
    use emqx_common::crd::Edition;

    #[test]
    fn bootstrap_map_comes_first_then_bundles() {
        let cluster = sample_cluster("broker");
        let maps = compile_config_maps(&cluster);

        let names: Vec<_> = maps
            .iter()
            .filter_map(|m| m.metadata.name.as_deref())
            .collect();
        assert_eq!(
            names,
            vec![
                "broker-bootstrap-config",
                "broker-acl",
                "broker-loaded-modules",
                "broker-loaded-plugins"
            ]
        );

        let data = maps[0].data.as_ref().unwrap();
        assert_eq!(data[BOOTSTRAP_CONFIG_KEY], cluster.spec.bootstrap_config);
        let acl = maps[1].data.as_ref().unwrap();
        assert_eq!(acl["acl.conf"], cluster.spec.acl.content);
    }

    #[test]
    fn every_map_is_owned_by_the_cluster() {
        let cluster = sample_cluster("broker");
        for map in compile_config_maps(&cluster) {
            let owners = map.metadata.owner_references.unwrap();
            assert_eq!(owners[0].name, "broker");
            assert_eq!(map.metadata.namespace.as_deref(), Some("brokers"));
        }
    }

    #[test]
    fn license_secret_requires_payload() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.edition = Edition::Enterprise;
        assert!(compile_license_secret(&cluster).is_none());

        cluster.spec.license = Some("KEY".to_string());
        let secret = compile_license_secret(&cluster).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("broker-license"));
        assert_eq!(secret.string_data.unwrap()[LICENSE_KEY], "KEY");
    }
}
