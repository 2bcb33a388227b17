//! Admission validation for EmqxCluster objects

use kube::core::admission::Operation;
use kube::ResourceExt;
use tracing::debug;

use emqx_common::crd::EmqxCluster;
use emqx_common::Error;

/// Message returned when an update touches the bootstrap configuration
pub const BOOTSTRAP_IMMUTABLE: &str = "bootstrap config cannot be updated";

/// Validate one admission operation
///
/// Creation runs `EmqxClusterSpec::validate`. Updates first reject any change to the
/// bootstrap configuration text, then run the same checks. Deletion is
/// always allowed.
pub fn validate_admission(
    operation: &Operation,
    old: Option<&EmqxCluster>,
    new: Option<&EmqxCluster>,
) -> Result<(), Error> {
    match operation {
        Operation::Create => {
            let new = require(new)?;
            new.spec.validate(&new.name_any())
        }
        Operation::Update => {
            let new = require(new)?;
            let name = new.name_any();
            if let Some(old) = old {
                if old.spec.bootstrap_config != new.spec.bootstrap_config {
                    debug!(cluster = %name, "rejecting bootstrap config change");
                    return Err(Error::validation_for_field(
                        name,
                        "spec.bootstrapConfig",
                        BOOTSTRAP_IMMUTABLE,
                    ));
                }
            }
            new.spec.validate(&name)
        }
        Operation::Delete | Operation::Connect => Ok(()),
    }
}

fn require(object: Option<&EmqxCluster>) -> Result<&EmqxCluster, Error> {
    object.ok_or_else(|| Error::validation("admission request carries no object"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use emqx_common::crd::{Edition, EmqxClusterSpec};
    use rstest::rstest;

    fn cluster() -> EmqxCluster {
        let spec: EmqxClusterSpec = serde_json::from_value(serde_json::json!({
            "image": "emqx/emqx:5.1.0",
            "bootstrapConfig": "node {\n  cookie = \"c00kie\"\n}\n",
            "coreTemplate": { "replicas": 3 },
            "listener": { "ports": { "mqtt": 1883 } }
        }))
        .unwrap();
        EmqxCluster::new("broker", spec)
    }

    #[test]
    fn create_accepts_valid_spec() {
        assert!(validate_admission(&Operation::Create, None, Some(&cluster())).is_ok());
    }

    #[test]
    fn create_rejects_unparseable_bootstrap() {
        let mut bad = cluster();
        bad.spec.bootstrap_config = "node {".to_string();
        let err = validate_admission(&Operation::Create, None, Some(&bad)).unwrap_err();
        assert!(err.to_string().contains("failed to parse bootstrap config"));
    }

    #[test]
    fn create_rejects_license_on_open_edition() {
        let mut bad = cluster();
        bad.spec.edition = Edition::Open;
        bad.spec.license = Some("KEY".to_string());
        assert!(validate_admission(&Operation::Create, None, Some(&bad)).is_err());
    }

    #[test]
    fn create_rejects_duplicate_ports() {
        let mut bad = cluster();
        bad.spec.listener.ports.ws = 1883;
        assert!(validate_admission(&Operation::Create, None, Some(&bad)).is_err());
    }

    #[test]
    fn missing_object_is_rejected() {
        assert!(validate_admission(&Operation::Create, None, None).is_err());
    }

    /// Story: scale the core group without touching the bootstrap text, then
    /// try the same update with one character of the bootstrap changed
    #[test]
    fn story_bootstrap_text_is_write_once() {
        let old = cluster();

        let mut scaled = old.clone();
        scaled.spec.core_template.replicas = Some(5);
        assert!(validate_admission(&Operation::Update, Some(&old), Some(&scaled)).is_ok());

        let mut edited = scaled.clone();
        edited.spec.bootstrap_config = edited.spec.bootstrap_config.replace("c00kie", "c00kiE");
        let err = validate_admission(&Operation::Update, Some(&old), Some(&edited)).unwrap_err();
        assert!(err.to_string().contains(BOOTSTRAP_IMMUTABLE));
    }

    #[test]
    fn update_still_runs_spec_checks() {
        let old = cluster();
        let mut bad = old.clone();
        bad.spec.image = String::new();
        assert!(validate_admission(&Operation::Update, Some(&old), Some(&bad)).is_err());
    }

    #[rstest]
    #[case(Operation::Delete)]
    #[case(Operation::Connect)]
    fn delete_and_connect_are_permissive(#[case] operation: Operation) {
        let mut bad = cluster();
        bad.spec.bootstrap_config = "node {".to_string();
        assert!(validate_admission(&operation, Some(&bad), None).is_ok());
    }
}
