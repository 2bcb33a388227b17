//! CRD installation on startup

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use emqx_common::crd::EmqxCluster;
use emqx_common::FIELD_MANAGER;

/// Install or update the EmqxCluster CRD with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = EmqxCluster::crd();
    let name = EmqxCluster::crd_name();

    tracing::info!("Installing {} CRD...", name);
    crds.patch(name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    tracing::info!("EmqxCluster CRD installed/updated");
    Ok(())
}

/// CRD manifest as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&EmqxCluster::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_is_namespaced_under_apps_emqx_io() {
        let crd = EmqxCluster::crd();
        assert_eq!(EmqxCluster::crd_name(), "emqxclusters.apps.emqx.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, "v2alpha1");
        assert!(crd.spec.versions[0].subresources.as_ref().unwrap().status.is_some());
    }

    #[test]
    fn yaml_names_the_kind() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("kind: EmqxCluster"));
        assert!(yaml.contains("shortNames"));
    }
}
