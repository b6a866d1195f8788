//! Custom Resource Definitions for the deployer
//!
//! Cluster and Machine records live in the `cluster.k8s.io/v1alpha1` group.

mod cluster;
mod machine;
mod types;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use machine::{Machine, MachineSpec, PUBLIC_IP_LABEL};
pub use types::{ApiEndpoint, EtcdSpec, MachineRole};
