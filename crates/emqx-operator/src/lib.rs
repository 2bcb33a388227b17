//! EMQX operator: controller wiring and admission webhook

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// Controller construction
pub mod controller_runner;
/// Startup utilities (CRD install, webhook registration)
pub mod startup;
/// Admission webhook (defaulting and validation)
pub mod webhook;
