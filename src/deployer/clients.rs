//! Collaborators the bootstrapper drives
//!
//! Each external system sits behind a trait so the state machine can be
//! exercised with mocks and in-memory doubles:
//!
//! - [`ObjectStore`] - Cluster and Machine records
//! - [`MachineDeployer`] - the cloud side: VMs, load balancers, IPs
//! - [`ControlPlaneApi`] - readiness probes against the new API server
//! - [`ClusterConnector`] - builds the two API clients above

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::{ApiEndpoint, Cluster, Machine};
use crate::script::ProvisioningScript;
use crate::Result;

/// Cluster and Machine record storage
///
/// Creates that collide with an existing name fail with
/// [`crate::Error::AlreadyExists`]; callers treat that as an expected
/// outcome.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a Cluster record
    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Get a Cluster record by name
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>>;

    /// List all Cluster records
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    /// Replace the status of a Cluster record
    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Create a Machine record
    async fn create_machine(&self, machine: &Machine) -> Result<Machine>;

    /// Get a Machine record by name
    async fn get_machine(&self, name: &str) -> Result<Option<Machine>>;

    /// List all Machine records
    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Delete a Machine record; deleting a missing record succeeds
    async fn delete_machine(&self, name: &str) -> Result<()>;
}

/// Creates cloud resources for machines
///
/// Every call may be slow. Failures surface as [`crate::Error::Provider`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineDeployer: Send + Sync {
    /// Create the VM for a machine, booting it with the given script
    async fn create(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        script: &ProvisioningScript,
    ) -> Result<()>;

    /// Create the load balancer fronting a master
    async fn create_load_balancer(&self, machine: &Machine) -> Result<()>;

    /// Public IP of a machine; empty until one is assigned
    async fn get_ip(&self, machine: &Machine) -> Result<String>;

    /// Admin kubeconfig of a master; empty until the control plane is up
    async fn get_kubeconfig(&self, master: &Machine) -> Result<String>;

    /// Deploy the machine controller and its API server add-ons
    async fn create_machine_controller(&self, cluster: &Cluster, machines: &[Machine])
        -> Result<()>;
}

/// Probes and setup calls against the new cluster's API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    /// Basic list call; succeeds once the API server answers
    async fn list_pods(&self) -> Result<usize>;

    /// Whether a service account exists
    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Whether an API group/version is served by discovery
    async fn group_version_registered(&self, group_version: &str) -> Result<bool>;

    /// Create a secret unless it already exists
    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Clients for a cluster reached through a kubeconfig
#[derive(Clone)]
pub struct ClusterClients {
    /// Probes and setup calls
    pub api: Arc<dyn ControlPlaneApi>,
    /// Cluster and Machine records
    pub store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ClusterClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClients").finish_non_exhaustive()
    }
}

/// Builds API clients for a new cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Admin client for an API server reachable at `endpoint`
    async fn admin_api(&self, endpoint: &ApiEndpoint) -> Result<Arc<dyn ControlPlaneApi>>;

    /// Clients built from a kubeconfig on disk
    async fn from_kubeconfig(&self, path: &Path) -> Result<ClusterClients>;
}
