//! Lattice Deployer - bootstraps a kubeadm cluster on a cloud provider
//!
//! The deployer creates a control-plane machine, waits for its API server,
//! wires up the object-store client, deploys the machine controller and then
//! creates the remaining machines. Each machine receives a provisioning
//! script rendered from a version-resolved configuration.
//!
//! # Modules
//!
//! - [`crd`] - Cluster and Machine resources (cluster.k8s.io/v1alpha1)
//! - [`version`] - Version resolution against the compatibility table
//! - [`provisioning`] - Per-machine provisioning configuration
//! - [`script`] - Provisioning script rendering from named fragments
//! - [`retry`] - Bounded polling and fixed-attempt retries
//! - [`etcd`] - Etcd leader/follower assignment
//! - [`deployer`] - The bootstrap state machine and its collaborators
//! - [`token`] - kubeadm join tokens
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod crd;
pub mod deployer;
pub mod error;
pub mod etcd;
pub mod provisioning;
pub mod retry;
pub mod script;
pub mod token;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding Cluster and Machine records
pub const DEFAULT_NAMESPACE: &str = "default";

/// Port the control-plane API is published on
pub const API_SERVER_PORT: u16 = 443;

/// API group/version that must be served before records can be written
pub const CLUSTER_API_GROUP_VERSION: &str = "cluster.k8s.io/v1alpha1";
