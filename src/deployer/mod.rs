//! Cluster bootstrap state machine
//!
//! [`ClusterBootstrapper::create_cluster`] walks a fixed sequence of phases
//! on a single thread of control:
//!
//! ```text
//! ValidatingInput -> CreatingMaster -> WaitingForApiServer -> EstablishingClient
//!   -> WaitingForServiceAccount -> DeployingControlPlaneAddons
//!   -> WaitingForResourceSchema -> PersistingClusterRecord -> CreatingWorkers -> Done
//! ```
//!
//! Every phase can fail. The only suspension points are the bounded waits
//! in [`crate::retry`]. A failure reports the phase it happened in and
//! whether the master VM already exists, so the caller can decide whether a
//! cleanup pass is needed.

mod clients;
mod k8s;
mod kubeconfig;
mod memory;

pub use clients::{ClusterClients, ClusterConnector, ControlPlaneApi, MachineDeployer, ObjectStore};
pub use k8s::{create_client, KubeConnector, KubeControlPlaneApi, KubeObjectStore};
pub use kubeconfig::write_kubeconfig;
pub use memory::InMemoryObjectStore;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::crd::{ApiEndpoint, Cluster, Machine};
use crate::etcd::EtcdTopologyPlanner;
use crate::provisioning::{Credentials, ProvisioningConfigBuilder};
use crate::retry::{poll_until_ready, retry_with_fixed_delay, PollConfig, ProbeErrors, RetryConfig};
use crate::script::{ProvisioningScript, ScriptRenderer};
use crate::version::VersionResolver;
use crate::{Error, Result, API_SERVER_PORT, CLUSTER_API_GROUP_VERSION};

/// Namespace of the service account that signals a usable control plane
pub const SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";
/// Service account that signals a usable control plane
pub const SERVICE_ACCOUNT_NAME: &str = "default";
/// Secret holding the cloud credential inside the new cluster
pub const CLOUD_CREDENTIAL_SECRET: &str = "cloud-credential";

/// Phases of a bootstrap run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Checking names and versions
    ValidatingInput,
    /// Load balancer, IP and VM for the master
    CreatingMaster,
    /// Waiting for the API server to answer a list call
    WaitingForApiServer,
    /// Credential propagation and kubeconfig write-out
    EstablishingClient,
    /// Waiting for the default service account
    WaitingForServiceAccount,
    /// Deploying the machine controller
    DeployingControlPlaneAddons,
    /// Waiting for the cluster API group to be served
    WaitingForResourceSchema,
    /// Writing the Cluster record and its endpoint
    PersistingClusterRecord,
    /// Creating the remaining machines one at a time
    CreatingWorkers,
    /// Bootstrap completed
    Done,
    /// Bootstrap stopped on a fatal error
    Failed,
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidatingInput => write!(f, "ValidatingInput"),
            Self::CreatingMaster => write!(f, "CreatingMaster"),
            Self::WaitingForApiServer => write!(f, "WaitingForAPIServer"),
            Self::EstablishingClient => write!(f, "EstablishingClient"),
            Self::WaitingForServiceAccount => write!(f, "WaitingForServiceAccount"),
            Self::DeployingControlPlaneAddons => write!(f, "DeployingControlPlaneAddons"),
            Self::WaitingForResourceSchema => write!(f, "WaitingForResourceSchema"),
            Self::PersistingClusterRecord => write!(f, "PersistingClusterRecord"),
            Self::CreatingWorkers => write!(f, "CreatingWorkers"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Every bounded wait of a bootstrap run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootstrapTimeouts {
    /// API server answering a list call
    pub api_server: PollConfig,
    /// Default service account existing
    pub service_account: PollConfig,
    /// Cluster API group being served
    pub resource_schema: PollConfig,
    /// Master reporting a public IP after VM creation
    pub master_ip: RetryConfig,
    /// Fetching the admin kubeconfig from the master
    pub kubeconfig: RetryConfig,
    /// Propagating the cloud credential secret
    pub credentials: RetryConfig,
    /// A deleted machine record disappearing
    pub machine_deletion: PollConfig,
}

impl Default for BootstrapTimeouts {
    fn default() -> Self {
        let five_seconds = Duration::from_secs(5);
        Self {
            api_server: PollConfig::new(five_seconds, Duration::from_secs(20 * 60)),
            service_account: PollConfig::new(five_seconds, Duration::from_secs(5 * 60)),
            resource_schema: PollConfig::new(five_seconds, Duration::from_secs(20 * 60)),
            master_ip: RetryConfig {
                max_attempts: 40,
                delay: five_seconds,
            },
            kubeconfig: RetryConfig {
                max_attempts: 5,
                delay: five_seconds,
            },
            credentials: RetryConfig {
                max_attempts: 5,
                delay: five_seconds,
            },
            machine_deletion: PollConfig::new(Duration::from_millis(500), Duration::from_secs(120)),
        }
    }
}

/// Inputs shared by every machine of a run
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    /// Where the admin kubeconfig is written and read back from
    pub kubeconfig_path: PathBuf,
    /// CA keys for masters, join token and CA hash for nodes
    pub credentials: Credentials,
    /// Base kubeadm master configuration
    pub master_configuration: Option<serde_json::Value>,
    /// Cloud credential copied into the new cluster
    pub cloud_credential: BTreeMap<String, String>,
    /// Bounded waits
    pub timeouts: BootstrapTimeouts,
}

impl BootstrapOptions {
    /// Options with default timeouts and no credentials
    pub fn new(kubeconfig_path: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig_path: kubeconfig_path.into(),
            credentials: Credentials::default(),
            master_configuration: None,
            cloud_credential: BTreeMap::new(),
            timeouts: BootstrapTimeouts::default(),
        }
    }
}

/// Machines created by one batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Names of machines created, in order
    pub created: Vec<String>,
    /// Control-plane machines created without an etcd role
    pub degraded: Vec<String>,
}

/// Result of a successful bootstrap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Cluster name
    pub cluster: String,
    /// Master machine name
    pub master: String,
    /// Published API endpoint
    pub endpoint: ApiEndpoint,
    /// Workers created after the master
    pub workers: BatchReport,
}

/// A bootstrap run that stopped on a fatal error
#[derive(Debug, thiserror::Error)]
#[error("bootstrap failed in {failed_in} (master VM created: {vm_created}): {error}")]
pub struct BootstrapFailure {
    /// Phase the error happened in
    pub failed_in: BootstrapPhase,
    /// Whether the master VM exists and may need cleanup
    pub vm_created: bool,
    /// The error
    #[source]
    pub error: Error,
}

struct Run {
    cluster: String,
    phase: BootstrapPhase,
    vm_created: bool,
}

impl Run {
    fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            phase: BootstrapPhase::ValidatingInput,
            vm_created: false,
        }
    }

    fn enter(&mut self, phase: BootstrapPhase) {
        info!(cluster = %self.cluster, phase = %phase, "Bootstrap phase");
        self.phase = phase;
    }

    fn fail(self, error: Error) -> BootstrapFailure {
        error!(
            cluster = %self.cluster,
            phase = %self.phase,
            next = %BootstrapPhase::Failed,
            vm_created = self.vm_created,
            error = %error,
            "Bootstrap failed"
        );
        BootstrapFailure {
            failed_in: self.phase,
            vm_created: self.vm_created,
            error,
        }
    }
}

/// Drives cluster creation against injected collaborators
pub struct ClusterBootstrapper {
    deployer: Arc<dyn MachineDeployer>,
    connector: Arc<dyn ClusterConnector>,
    resolver: VersionResolver,
    renderer: ScriptRenderer,
    planner: EtcdTopologyPlanner,
    options: BootstrapOptions,
}

impl ClusterBootstrapper {
    /// Create a bootstrapper with the built-in compatibility table, default
    /// artifact sources and default etcd topology
    pub fn new(
        deployer: Arc<dyn MachineDeployer>,
        connector: Arc<dyn ClusterConnector>,
        options: BootstrapOptions,
    ) -> Self {
        Self {
            deployer,
            connector,
            resolver: VersionResolver::default(),
            renderer: ScriptRenderer::default(),
            planner: EtcdTopologyPlanner::default(),
            options,
        }
    }

    /// Use a different version resolver
    pub fn with_resolver(mut self, resolver: VersionResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use a different script renderer
    pub fn with_renderer(mut self, renderer: ScriptRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Use a different etcd topology
    pub fn with_planner(mut self, planner: EtcdTopologyPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Bootstrap a cluster from its record and machine batch
    ///
    /// The batch must hold exactly one master. It is created first; the
    /// remaining machines follow in list order once the control plane is up.
    pub async fn create_cluster(
        &self,
        cluster: Cluster,
        machines: Vec<Machine>,
    ) -> std::result::Result<BootstrapReport, BootstrapFailure> {
        let mut run = Run::new(cluster.name_or_empty());
        let outcome = self.drive(&mut run, cluster, machines).await;
        match outcome {
            Ok(report) => {
                run.enter(BootstrapPhase::Done);
                Ok(report)
            }
            Err(error) => Err(run.fail(error)),
        }
    }

    async fn drive(
        &self,
        run: &mut Run,
        mut cluster: Cluster,
        mut machines: Vec<Machine>,
    ) -> Result<BootstrapReport> {
        let timeouts = &self.options.timeouts;

        run.enter(BootstrapPhase::ValidatingInput);
        let master_index = self.validate(&cluster, &mut machines)?;
        let cluster_name = cluster.name_or_empty().to_string();
        self.planner.assign_leader(&cluster_name, &mut machines);
        for machine in &mut machines {
            machine.spec.cluster_name = Some(cluster_name.clone());
        }
        let batch = machines.clone();
        let mut master = machines.remove(master_index);
        let workers = machines;

        run.enter(BootstrapPhase::CreatingMaster);
        let endpoint = self.create_master(run, &cluster, &mut master).await?;

        run.enter(BootstrapPhase::WaitingForApiServer);
        let admin = self.connector.admin_api(&endpoint).await?;
        let admin_ref = admin.as_ref();
        poll_until_ready(
            &format!("API server {} of cluster {cluster_name}", endpoint.url()),
            &timeouts.api_server,
            ProbeErrors::Retry,
            || async move { admin_ref.list_pods().await.map(|_| true) },
        )
        .await?;

        run.enter(BootstrapPhase::EstablishingClient);
        self.propagate_credentials(admin_ref).await?;
        self.fetch_kubeconfig(&master).await?;
        let clients = self
            .connector
            .from_kubeconfig(&self.options.kubeconfig_path)
            .await?;
        let api = clients.api.as_ref();
        let store = clients.store.as_ref();

        run.enter(BootstrapPhase::WaitingForServiceAccount);
        poll_until_ready(
            &format!(
                "service account {SERVICE_ACCOUNT_NAMESPACE}/{SERVICE_ACCOUNT_NAME} in cluster {cluster_name}"
            ),
            &timeouts.service_account,
            ProbeErrors::Retry,
            || async move {
                api.service_account_exists(SERVICE_ACCOUNT_NAMESPACE, SERVICE_ACCOUNT_NAME)
                    .await
            },
        )
        .await?;

        run.enter(BootstrapPhase::DeployingControlPlaneAddons);
        self.deployer
            .create_machine_controller(&cluster, &batch)
            .await?;

        run.enter(BootstrapPhase::WaitingForResourceSchema);
        poll_until_ready(
            &format!("API group {CLUSTER_API_GROUP_VERSION} in cluster {cluster_name}"),
            &timeouts.resource_schema,
            ProbeErrors::Retry,
            || async move { api.group_version_registered(CLUSTER_API_GROUP_VERSION).await },
        )
        .await?;

        run.enter(BootstrapPhase::PersistingClusterRecord);
        cluster = self.persist_cluster(store, &cluster, &endpoint).await?;

        run.enter(BootstrapPhase::CreatingWorkers);
        let master = self.persist_machine(store, &master).await?;
        let workers = self.create_machines(store, &cluster, workers).await?;

        Ok(BootstrapReport {
            cluster: cluster_name,
            master: master.display_name().to_string(),
            endpoint,
            workers,
        })
    }

    /// Check names, the master count, versions and credentials; name the master
    fn validate(&self, cluster: &Cluster, machines: &mut [Machine]) -> Result<usize> {
        let cluster_name = cluster.name_or_empty();
        if cluster_name.is_empty() {
            return Err(Error::validation(
                "cluster name must be specified for cluster creation",
            ));
        }

        let masters: Vec<usize> = machines
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_master())
            .map(|(i, _)| i)
            .collect();
        let master_index = match masters.as_slice() {
            [index] => *index,
            [] => {
                return Err(Error::validation(format!(
                    "cluster {cluster_name} has no master machine"
                )))
            }
            many => {
                return Err(Error::validation(format!(
                    "cluster {cluster_name} has {} master machines, expected exactly one",
                    many.len()
                )))
            }
        };

        let master = &mut machines[master_index];
        if master.metadata.name.as_deref().unwrap_or_default().is_empty() {
            let prefix = master
                .metadata
                .generate_name
                .as_deref()
                .unwrap_or_default();
            if prefix.is_empty() {
                return Err(Error::validation(format!(
                    "master machine of cluster {cluster_name} needs a name or generateName"
                )));
            }
            master.metadata.name = Some(format!("{prefix}{cluster_name}"));
        }

        let credentials = &self.options.credentials;
        for machine in machines.iter() {
            self.resolver
                .resolve(&machine.spec.kubernetes_version)
                .and_then(|_| credentials.require_for(machine.spec.role))
                .map_err(|e| {
                    warn!(
                        cluster = %cluster_name,
                        machine = %machine.display_name(),
                        error = %e,
                        "Rejected machine"
                    );
                    Error::for_machine(machine.display_name(), e)
                })?;
        }

        Ok(master_index)
    }

    async fn create_master(
        &self,
        run: &mut Run,
        cluster: &Cluster,
        master: &mut Machine,
    ) -> Result<ApiEndpoint> {
        let name = master.display_name().to_string();
        info!(cluster = %run.cluster, machine = %name, "Creating load balancer");
        self.deployer.create_load_balancer(master).await?;

        let ip = self.deployer.get_ip(master).await?;
        if !ip.is_empty() {
            master.set_public_ip(ip);
        }

        let script = self.render(cluster, master)?;
        self.deployer.create(cluster, master, &script).await?;
        run.vm_created = true;
        info!(
            cluster = %run.cluster,
            machine = %name,
            digest = %script.digest(),
            "Created master"
        );

        let deployer = self.deployer.as_ref();
        let master_ref: &Machine = master;
        let ip = retry_with_fixed_delay(&self.options.timeouts.master_ip, "master IP", || async move {
            match deployer.get_ip(master_ref).await {
                Ok(ip) if !ip.is_empty() => Ok(ip),
                Ok(_) => Err(Error::provider(format!(
                    "master {} has no IP yet",
                    master_ref.display_name()
                ))),
                Err(e) => Err(e),
            }
        })
        .await?;

        info!(cluster = %run.cluster, machine = %name, ip = %ip, "Master IP assigned");
        Ok(ApiEndpoint::new(ip, API_SERVER_PORT))
    }

    async fn propagate_credentials(&self, admin: &dyn ControlPlaneApi) -> Result<()> {
        let data = &self.options.cloud_credential;
        retry_with_fixed_delay(
            &self.options.timeouts.credentials,
            "cloud credential secret",
            || async move {
                admin
                    .ensure_secret(SERVICE_ACCOUNT_NAMESPACE, CLOUD_CREDENTIAL_SECRET, data)
                    .await
            },
        )
        .await
    }

    async fn fetch_kubeconfig(&self, master: &Machine) -> Result<()> {
        let deployer = self.deployer.as_ref();
        let content = retry_with_fixed_delay(
            &self.options.timeouts.kubeconfig,
            "fetch kubeconfig",
            || async move {
                let content = deployer.get_kubeconfig(master).await?;
                if content.trim().is_empty() {
                    Err(Error::provider(format!(
                        "kubeconfig of master {} is not available yet",
                        master.display_name()
                    )))
                } else {
                    Ok(content)
                }
            },
        )
        .await?;
        write_kubeconfig(&self.options.kubeconfig_path, &content).await
    }

    async fn persist_cluster(
        &self,
        store: &dyn ObjectStore,
        cluster: &Cluster,
        endpoint: &ApiEndpoint,
    ) -> Result<Cluster> {
        let name = cluster.name_or_empty();
        let mut stored = match store.create_cluster(cluster).await {
            Ok(stored) => stored,
            Err(e) if e.is_already_exists() => {
                debug!(cluster = %name, "Cluster record already exists");
                store.get_cluster(name).await?.ok_or_else(|| {
                    Error::validation(format!("cluster {name} disappeared after create conflict"))
                })?
            }
            Err(e) => return Err(e),
        };

        stored.publish_endpoint(endpoint.clone());
        let stored = store.update_cluster_status(&stored).await?;
        info!(cluster = %name, endpoint = %endpoint.address(), "Published API endpoint");
        Ok(stored)
    }

    async fn persist_machine(&self, store: &dyn ObjectStore, machine: &Machine) -> Result<Machine> {
        match store.create_machine(machine).await {
            Ok(stored) => Ok(stored),
            Err(e) if e.is_already_exists() => {
                debug!(machine = %machine.display_name(), "Machine record already exists");
                Ok(machine.clone())
            }
            Err(e) => Err(e),
        }
    }

    fn render(&self, cluster: &Cluster, machine: &Machine) -> Result<ProvisioningScript> {
        let mut builder = ProvisioningConfigBuilder::for_machine(cluster, machine)
            .credentials(self.options.credentials.clone());
        if machine.is_master() {
            if let Some(doc) = &self.options.master_configuration {
                builder = builder.master_configuration(doc.clone());
            }
        }
        let config = builder.build(&self.resolver)?;
        self.renderer.render(&config)
    }

    /// Create machines one at a time, stopping at the first failure
    async fn create_machines(
        &self,
        store: &dyn ObjectStore,
        cluster: &Cluster,
        machines: Vec<Machine>,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for mut machine in machines {
            let name = machine.display_name().to_string();
            if let Err(source) = self
                .create_machine(store, cluster, &mut machine, &mut report)
                .await
            {
                error!(
                    cluster = %cluster.name_or_empty(),
                    machine = %name,
                    created = report.created.len(),
                    error = %source,
                    "Machine creation failed, stopping batch"
                );
                return Err(Error::PartialBatch {
                    created: report.created.len(),
                    machine: name,
                    source: Box::new(source),
                });
            }
        }
        Ok(report)
    }

    async fn create_machine(
        &self,
        store: &dyn ObjectStore,
        cluster: &Cluster,
        machine: &mut Machine,
        report: &mut BatchReport,
    ) -> Result<()> {
        machine.spec.cluster_name = Some(cluster.name_or_empty().to_string());

        // Leadership is only ever granted at bootstrap; any etcd fields the
        // caller supplied are replaced.
        machine.spec.etcd = None;
        if machine.is_master() {
            let stored = store.list_machines().await?;
            let leader = self.planner.find_leader(&stored)?;
            if self.planner.assign_follower(leader, machine).is_degraded() {
                report.degraded.push(machine.display_name().to_string());
            }
        }

        let script = self.render(cluster, machine)?;
        self.deployer.create(cluster, machine, &script).await?;
        let stored = self.persist_machine(store, machine).await?;

        info!(
            cluster = %cluster.name_or_empty(),
            machine = %stored.display_name(),
            role = %stored.spec.role,
            "Added machine"
        );
        report.created.push(stored.display_name().to_string());
        Ok(())
    }

    /// Add machines to the cluster recorded behind the configured kubeconfig
    ///
    /// Later masters join the existing etcd leader as followers.
    pub async fn add_machines(&self, machines: Vec<Machine>) -> Result<BatchReport> {
        let clients = self
            .connector
            .from_kubeconfig(&self.options.kubeconfig_path)
            .await?;
        let store = clients.store.as_ref();
        let cluster = single_cluster(store).await?;
        info!(
            cluster = %cluster.name_or_empty(),
            count = machines.len(),
            "Adding machines"
        );
        self.create_machines(store, &cluster, machines).await
    }

    /// Delete every non-master Machine record, waiting for each to go away
    pub async fn delete_all_machines(&self) -> Result<Vec<String>> {
        let clients = self
            .connector
            .from_kubeconfig(&self.options.kubeconfig_path)
            .await?;
        delete_all_machines(
            clients.store.as_ref(),
            &self.options.timeouts.machine_deletion,
        )
        .await
    }
}

/// Delete every non-master Machine record in `store`
///
/// Records are deleted one at a time; each must disappear within `wait`
/// before the next is touched. Returns the deleted names in store order.
pub async fn delete_all_machines(store: &dyn ObjectStore, wait: &PollConfig) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for machine in store.list_machines().await? {
        if machine.is_master() {
            continue;
        }
        let name = machine.display_name();
        store.delete_machine(name).await?;
        poll_until_ready(
            &format!("machine {name} to be deleted"),
            wait,
            ProbeErrors::Surface,
            || async move { Ok(store.get_machine(name).await?.is_none()) },
        )
        .await?;
        info!(machine = %name, "Deleted machine");
        deleted.push(name.to_string());
    }
    Ok(deleted)
}

async fn single_cluster(store: &dyn ObjectStore) -> Result<Cluster> {
    let mut clusters = store.list_clusters().await?;
    if clusters.len() != 1 {
        return Err(Error::validation(format!(
            "expected exactly one Cluster record, found {}",
            clusters.len()
        )));
    }
    Ok(clusters.remove(0))
}
