//! Kubernetes-backed collaborators

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use super::clients::{ClusterClients, ClusterConnector, ControlPlaneApi, ObjectStore};
use crate::crd::{ApiEndpoint, Cluster, Machine};
use crate::{Error, Result, DEFAULT_NAMESPACE};

/// Connection timeout for clients against a new API server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for clients against a new API server
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Field manager recorded on status updates
const FIELD_MANAGER: &str = "lattice-deployer";

/// Create a kube client from a kubeconfig file
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let config = load_kubeconfig(kubeconfig).await?;
    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {e}")))
}

async fn load_kubeconfig(path: &Path) -> Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!("failed to read kubeconfig {}: {e}", path.display()))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig {}: {e}", path.display())))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Body of a status replace, pinned to the record version it was read at
fn status_update_body(cluster: &Cluster, resource_version: String) -> Result<Vec<u8>> {
    let mut body = cluster.clone();
    body.metadata.resource_version = Some(resource_version);
    serde_json::to_vec(&body).map_err(|e| {
        Error::serialization(format!(
            "failed to serialize cluster {}: {e}",
            cluster.name_or_empty()
        ))
    })
}

/// Cluster and Machine records in the default namespace
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self) -> Api<Cluster> {
        Api::namespaced(self.client.clone(), DEFAULT_NAMESPACE)
    }

    fn machines(&self) -> Api<Machine> {
        Api::namespaced(self.client.clone(), DEFAULT_NAMESPACE)
    }
}

fn conflict_as_exists(e: kube::Error, kind: &'static str, name: &str) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        other => other.into(),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        self.clusters()
            .create(&PostParams::default(), cluster)
            .await
            .map_err(|e| conflict_as_exists(e, "Cluster", cluster.name_or_empty()))
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters().get_opt(name).await?)
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters().list(&ListParams::default()).await?.items)
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let name = cluster.name_or_empty();
        let resource_version = match &cluster.metadata.resource_version {
            Some(version) => version.clone(),
            None => self
                .clusters()
                .get(name)
                .await?
                .metadata
                .resource_version
                .unwrap_or_default(),
        };

        Ok(self
            .clusters()
            .replace_status(
                name,
                &PostParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                status_update_body(cluster, resource_version)?,
            )
            .await?)
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine> {
        self.machines()
            .create(&PostParams::default(), machine)
            .await
            .map_err(|e| conflict_as_exists(e, "Machine", machine.display_name()))
    }

    async fn get_machine(&self, name: &str) -> Result<Option<Machine>> {
        Ok(self.machines().get_opt(name).await?)
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        Ok(self.machines().list(&ListParams::default()).await?.items)
    }

    async fn delete_machine(&self, name: &str) -> Result<()> {
        match self.machines().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(machine = %name, "Machine already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Readiness probes against a real API server
pub struct KubeControlPlaneApi {
    client: Client,
}

impl KubeControlPlaneApi {
    /// Create a probe client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlaneApi for KubeControlPlaneApi {
    async fn list_pods(&self) -> Result<usize> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default().limit(1)).await?;
        Ok(pods.items.len())
    }

    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn group_version_registered(&self, group_version: &str) -> Result<bool> {
        match self.client.list_api_group_resources(group_version).await {
            Ok(resources) => Ok(!resources.resources.is_empty()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(data.clone()),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(secret = %name, namespace = %namespace, "Secret already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds kube clients for a new cluster
///
/// The admin client reuses the credentials of `admin_kubeconfig` when given,
/// pointed at the new API server; otherwise it connects anonymously. The
/// server certificate is not verified for admin probes since the cluster CA
/// is not in any local trust store yet.
#[derive(Clone, Debug, Default)]
pub struct KubeConnector {
    admin_kubeconfig: Option<PathBuf>,
}

impl KubeConnector {
    /// Create a connector
    pub fn new(admin_kubeconfig: Option<PathBuf>) -> Self {
        Self { admin_kubeconfig }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn admin_api(&self, endpoint: &ApiEndpoint) -> Result<Arc<dyn ControlPlaneApi>> {
        let url: http::Uri = endpoint
            .url()
            .parse()
            .map_err(|e| Error::validation(format!("invalid API endpoint {}: {e}", endpoint.url())))?;

        let mut config = match &self.admin_kubeconfig {
            Some(path) => {
                let mut config = load_kubeconfig(path).await?;
                config.cluster_url = url;
                config
            }
            None => {
                let mut config = Config::new(url);
                config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
                config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
                config
            }
        };
        config.accept_invalid_certs = true;

        let client = Client::try_from(config)
            .map_err(|e| Error::config(format!("failed to create admin client: {e}")))?;
        Ok(Arc::new(KubeControlPlaneApi::new(client)))
    }

    async fn from_kubeconfig(&self, path: &Path) -> Result<ClusterClients> {
        let client = create_client(path).await?;
        Ok(ClusterClients {
            api: Arc::new(KubeControlPlaneApi::new(client.clone())),
            store: Arc::new(KubeObjectStore::new(client)),
        })
    }
}
