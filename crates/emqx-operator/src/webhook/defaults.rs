//! Defaulting applied to EmqxCluster objects before they are stored

use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::debug;

use emqx_common::crd::{DbRole, EmqxCluster};
use emqx_common::hocon::{ConfigDocument, DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USERNAME};
use emqx_common::{Error, LABEL_DB_ROLE, LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGED_BY_VALUE};

/// Length of a generated node cookie
pub const COOKIE_LENGTH: usize = 64;

/// Bootstrap path whose absence triggers cookie generation
pub const COOKIE_PATH: &str = "node.cookie";

/// Generate a node cookie with upper-case, lower-case and digit characters
pub fn generate_cookie() -> String {
    loop {
        let cookie: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(COOKIE_LENGTH)
            .map(char::from)
            .collect();
        let mixed = cookie.chars().any(|c| c.is_ascii_uppercase())
            && cookie.chars().any(|c| c.is_ascii_lowercase())
            && cookie.chars().any(|c| c.is_ascii_digit());
        if mixed {
            return cookie;
        }
    }
}

/// Default bootstrap block placed ahead of the user's configuration
fn default_bootstrap_block(cookie: &str) -> String {
    format!(
        r#"node {{
  cookie = "{cookie}"
  data_dir = "data"
  etc_dir = "etc"
}}
dashboard {{
  listeners {{
    http {{
      bind = "18083"
    }}
  }}
  default_username = "{DEFAULT_ADMIN_USERNAME}"
  default_password = "{DEFAULT_ADMIN_PASSWORD}"
}}
listeners {{
  tcp {{
    default {{
      bind = "0.0.0.0:1883"
      max_connections = 1024000
    }}
  }}
}}
"#
    )
}

/// Fold generated defaults into a bootstrap configuration without a cookie
///
/// Later keys win, so anything the user wrote overrides the defaults. The
/// merged text is parsed and rendered again so only well-formed canonical
/// text is stored. Configurations that already carry a cookie are returned
/// untouched.
pub fn default_bootstrap_config(bootstrap: &str) -> Result<Option<String>, Error> {
    if ConfigDocument::parse(bootstrap)?.contains(COOKIE_PATH) {
        return Ok(None);
    }
    let merged = format!("{}\n{}", default_bootstrap_block(&generate_cookie()), bootstrap);
    Ok(Some(ConfigDocument::parse(&merged)?.render()))
}

/// Apply admission defaults in place
///
/// The bootstrap configuration is only defaulted on creation since it is
/// immutable afterwards. Labels and the replicant replica count are
/// defaulted on every admission.
pub fn apply_defaults(cluster: &mut EmqxCluster, creating: bool) -> Result<(), Error> {
    if creating {
        if let Some(config) = default_bootstrap_config(&cluster.spec.bootstrap_config)? {
            debug!("generated node cookie and default admin account");
            cluster.spec.bootstrap_config = config;
        }
    }

    let name = cluster.name_any();
    let labels = cluster.labels_mut();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_INSTANCE.to_string(), name.clone());

    for role in [DbRole::Core, DbRole::Replicant] {
        let template = match role {
            DbRole::Core => &mut cluster.spec.core_template,
            DbRole::Replicant => &mut cluster.spec.replicant_template,
        };
        template
            .labels
            .insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        template.labels.insert(LABEL_INSTANCE.to_string(), name.clone());
        template
            .labels
            .insert(LABEL_DB_ROLE.to_string(), role.as_str().to_string());
    }

    cluster.spec.replicant_template.replicas.get_or_insert(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emqx_common::crd::EmqxClusterSpec;

    fn cluster(bootstrap: &str) -> EmqxCluster {
        let spec: EmqxClusterSpec = serde_json::from_value(serde_json::json!({
            "image": "emqx/emqx:5.1.0",
            "bootstrapConfig": bootstrap,
        }))
        .unwrap();
        EmqxCluster::new("broker", spec)
    }

    #[test]
    fn generated_cookie_is_long_and_mixed() {
        let cookie = generate_cookie();
        assert_eq!(cookie.len(), COOKIE_LENGTH);
        assert!(cookie.chars().any(|c| c.is_ascii_uppercase()));
        assert!(cookie.chars().any(|c| c.is_ascii_lowercase()));
        assert!(cookie.chars().any(|c| c.is_ascii_digit()));
        assert_ne!(cookie, generate_cookie());
    }

    /// Story: a cluster created without any bootstrap configuration
    #[test]
    fn story_create_without_cookie_gets_generated_config() {
        let mut cluster = cluster("");

        apply_defaults(&mut cluster, true).unwrap();

        let doc = ConfigDocument::parse(&cluster.spec.bootstrap_config).unwrap();
        let cookie = doc.get_str("node.cookie").unwrap();
        assert!(cookie.len() >= COOKIE_LENGTH);
        assert_eq!(doc.get_str("dashboard.default_username").as_deref(), Some("admin"));
        assert_eq!(
            doc.get_str("listeners.tcp.default.bind").as_deref(),
            Some("0.0.0.0:1883")
        );
    }

    #[test]
    fn user_settings_override_generated_defaults() {
        let mut cluster = cluster("dashboard {\n  default_password = \"s3cret\"\n}\n");

        apply_defaults(&mut cluster, true).unwrap();

        let doc = ConfigDocument::parse(&cluster.spec.bootstrap_config).unwrap();
        assert!(doc.contains("node.cookie"));
        assert_eq!(doc.get_str("dashboard.default_password").as_deref(), Some("s3cret"));
        assert_eq!(doc.get_str("dashboard.default_username").as_deref(), Some("admin"));
    }

    #[test]
    fn existing_cookie_leaves_bootstrap_untouched() {
        let text = "node {\n  cookie = \"mine\"\n}\n";
        let mut cluster = cluster(text);

        apply_defaults(&mut cluster, true).unwrap();

        assert_eq!(cluster.spec.bootstrap_config, text);
    }

    #[test]
    fn update_never_touches_bootstrap() {
        let mut cluster = cluster("");
        apply_defaults(&mut cluster, false).unwrap();
        assert_eq!(cluster.spec.bootstrap_config, "");
    }

    #[test]
    fn unparseable_bootstrap_is_an_error() {
        let mut cluster = cluster("node {");
        assert!(apply_defaults(&mut cluster, true).is_err());
    }

    #[test]
    fn labels_are_stamped_on_every_admission() {
        let mut cluster = cluster("node { cookie = \"c\" }");
        cluster.spec.core_template.labels.insert(LABEL_DB_ROLE.to_string(), "bogus".to_string());

        apply_defaults(&mut cluster, false).unwrap();

        assert_eq!(cluster.labels().get(LABEL_INSTANCE).map(String::as_str), Some("broker"));
        assert_eq!(
            cluster.labels().get(LABEL_MANAGED_BY).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
        assert_eq!(
            cluster.spec.core_template.labels.get(LABEL_DB_ROLE).map(String::as_str),
            Some("core")
        );
        assert_eq!(
            cluster.spec.replicant_template.labels.get(LABEL_DB_ROLE).map(String::as_str),
            Some("replicant")
        );
    }

    #[test]
    fn replicant_replicas_default_to_zero_only_when_unset() {
        let mut unset = cluster("");
        apply_defaults(&mut unset, false).unwrap();
        assert_eq!(unset.spec.replicant_template.replicas, Some(0));

        let mut set = cluster("");
        set.spec.replicant_template.replicas = Some(4);
        apply_defaults(&mut set, false).unwrap();
        assert_eq!(set.spec.replicant_template.replicas, Some(4));
    }
}
