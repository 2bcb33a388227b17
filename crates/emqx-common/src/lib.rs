//! Common types for the EMQX operator: CRDs, configuration documents, errors and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod hocon;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by the operator
pub const FIELD_MANAGER: &str = "emqx-operator";

/// Label key marking objects managed by this operator
pub const LABEL_MANAGED_BY: &str = "apps.emqx.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY_VALUE: &str = "emqx-operator";

/// Label key carrying the owning cluster's name
pub const LABEL_INSTANCE: &str = "apps.emqx.io/instance";

/// Label key discriminating core and replicant node groups
pub const LABEL_DB_ROLE: &str = "apps.emqx.io/db-role";

/// Custom pod condition type computed per broker pod
pub const ON_SERVING_CONDITION: &str = "OnServing";

/// Platform pod condition signalling that every container is ready
pub const CONTAINERS_READY_CONDITION: &str = "ContainersReady";
