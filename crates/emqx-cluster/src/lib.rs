//! Cluster lifecycle management for EMQX brokers
//!
//! This crate provides the Kubernetes controller for EmqxCluster CRDs:
//! - `compiler`: pure derivation of the desired object set from a spec
//! - `tunnel`: short-lived port-forward tunnels to a broker's admin API
//! - `nodes`: broker membership as reported by a core member
//! - `conditions`: the per-pod `OnServing` condition
//! - `status`: cluster status aggregation
//! - `controller`: the reconcile pipeline tying the above together

pub mod compiler;
pub mod conditions;
pub mod controller;
pub mod nodes;
pub mod status;
pub mod tunnel;

// Re-export controller types
pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl, Pipeline,
    ReconcileConfig, StepResult, SubReconciler,
};

pub use compiler::{compile, CompiledCluster};
pub use tunnel::{BrokerAdmin, PortForwardAdmin, TunnelHandle};

// Re-export common error types
pub use emqx_common::{Error, Result};
