//! Per-machine provisioning configuration
//!
//! A [`ProvisioningConfig`] is everything a script needs to turn a bare VM
//! into a cluster member: its role, resolved versions, OS package pins,
//! kubelet flags, cloud settings and the credentials its role requires.
//! Configs are built fresh for every machine and never persisted.

use std::collections::HashMap;

use crate::crd::{Cluster, Machine, MachineRole};
use crate::version::{ResolvedVersions, VersionResolver};
use crate::{Error, Result};

/// System packages every machine installs
pub const BASE_PACKAGES: &[&str] = &[
    "cron",
    "docker.io",
    "ebtables",
    "git",
    "glusterfs-client",
    "haveged",
    "jq",
    "nfs-common",
    "socat",
];

/// Time synchronisation package for providers that do not supply one
pub const TIME_SYNC_PACKAGE: &str = "ntp";

/// Providers whose images already run a time synchronisation daemon
const PROVIDERS_WITH_TIME_SYNC: &[&str] = &["gce", "gke"];

/// Whether the cloud provider's images already keep time in sync
pub fn provider_supplies_time_sync(provider: &str) -> bool {
    PROVIDERS_WITH_TIME_SYNC.contains(&provider.to_lowercase().as_str())
}

/// Full, ordered OS package list for a machine
///
/// The three cluster binaries are pinned to the patch release and
/// kubernetes-cni to its compatibility-table version.
pub fn package_list(versions: &ResolvedVersions, provider: &str) -> Vec<String> {
    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|p| p.to_string()).collect();
    for binary in ["kubelet", "kubectl", "kubeadm"] {
        packages.push(format!("{binary}={}*", versions.patch));
    }
    packages.push(format!("kubernetes-cni={}*", versions.network_plugin));

    if !provider_supplies_time_sync(provider) {
        packages.push(TIME_SYNC_PACKAGE.to_string());
    }
    packages
}

/// Format kubelet flags as `--key=value` pairs in key order
///
/// Sorting makes the output independent of map iteration order, so the same
/// flags always render the same script.
pub fn format_kubelet_args<'a, I>(args: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut pairs: Vec<_> = args.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(k, v)| format!("--{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Credential material handed to a machine
///
/// Masters receive CA private keys; nodes receive the join token and the
/// CA public key hash. The builder drops whatever the role does not need.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// kubeadm bootstrap token, passed verbatim to `kubeadm join`
    pub kubeadm_token: Option<String>,
    /// `sha256:<hex>` hash of the cluster CA public key
    pub ca_hash: Option<String>,
    /// Cluster CA private key (PEM)
    pub ca_key: Option<String>,
    /// Front proxy CA private key (PEM)
    pub front_proxy_key: Option<String>,
}

impl Credentials {
    /// Fail unless every credential `role` needs is present
    ///
    /// The API server address a node joins is not a credential and is
    /// checked when its config is built.
    pub fn require_for(&self, role: MachineRole) -> Result<()> {
        missing_error(role, &missing_credentials(role, self))
    }

    fn for_role(self, role: MachineRole) -> Self {
        match role {
            MachineRole::Master => Self {
                kubeadm_token: None,
                ca_hash: None,
                ..self
            },
            MachineRole::Node => Self {
                ca_key: None,
                front_proxy_key: None,
                ..self
            },
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("Credentials")
            .field("kubeadm_token", &self.kubeadm_token.as_ref().map(|_| "<redacted>"))
            .field("ca_hash", &self.ca_hash)
            .field("ca_key", &self.ca_key.as_ref().map(|_| "<redacted>"))
            .field(
                "front_proxy_key",
                &self.front_proxy_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Everything needed to render one machine's provisioning script
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisioningConfig {
    /// Machine role
    pub role: MachineRole,
    /// Resolved versions
    pub versions: ResolvedVersions,
    /// Ordered OS package list
    pub packages: Vec<String>,
    /// Extra kubelet flags (unordered; rendering sorts them)
    pub kubelet_extra_args: HashMap<String, String>,
    /// Cloud-config contents
    pub cloud_config: Option<String>,
    /// Network provider selector (flannel, calico, weavenet)
    pub network_provider: String,
    /// Cloud provider name
    pub provider: String,
    /// Whether the cloud controller manager is deployed
    pub external_provider: bool,
    /// API server `host:port` nodes join against
    pub api_server_address: Option<String>,
    /// Base kubeadm master configuration, serialized as YAML
    pub master_configuration: Option<String>,
    /// Credential material for this role
    pub credentials: Credentials,
}

impl ProvisioningConfig {
    /// Start building a config for a role and Kubernetes version
    pub fn builder(role: MachineRole, kubernetes_version: impl Into<String>) -> ProvisioningConfigBuilder {
        ProvisioningConfigBuilder::new(role, kubernetes_version)
    }

    /// Space separated package list for `apt-get install`
    pub fn package_list(&self) -> String {
        self.packages.join(" ")
    }

    /// Kubelet flags in deterministic order
    pub fn kubelet_extra_args_str(&self) -> String {
        format_kubelet_args(&self.kubelet_extra_args)
    }

    /// pre-k release downloaded out of band
    pub fn bootstrap_tool_version(&self) -> &str {
        &self.versions.bootstrap_tool
    }

    /// Whether the forked kubeadm binary replaces the packaged one
    pub fn uses_forked_kubeadm(&self) -> bool {
        self.versions.uses_forked_kubeadm()
    }
}

/// Builder for [`ProvisioningConfig`]
#[derive(Clone, Debug)]
pub struct ProvisioningConfigBuilder {
    role: MachineRole,
    kubernetes_version: String,
    provider: String,
    network_provider: String,
    cloud_config: Option<String>,
    external_provider: bool,
    kubelet_extra_args: HashMap<String, String>,
    master_configuration: Option<serde_json::Value>,
    api_server_address: Option<String>,
    credentials: Credentials,
}

impl ProvisioningConfigBuilder {
    fn new(role: MachineRole, kubernetes_version: impl Into<String>) -> Self {
        Self {
            role,
            kubernetes_version: kubernetes_version.into(),
            provider: String::new(),
            network_provider: String::new(),
            cloud_config: None,
            external_provider: false,
            kubelet_extra_args: HashMap::new(),
            master_configuration: None,
            api_server_address: None,
            credentials: Credentials::default(),
        }
    }

    /// Seed a builder from a Cluster and Machine record
    pub fn for_machine(cluster: &Cluster, machine: &Machine) -> Self {
        let mut builder = Self::new(machine.spec.role, machine.spec.kubernetes_version.clone())
            .provider(cluster.spec.provider.clone())
            .network_provider(cluster.spec.network_provider.clone())
            .external_provider(cluster.spec.external_cloud_provider);
        if let Some(cloud_config) = &cluster.spec.cloud_config {
            builder = builder.cloud_config(cloud_config.clone());
        }
        for (k, v) in &machine.spec.kubelet_extra_args {
            builder = builder.kubelet_arg(k.clone(), v.clone());
        }
        if let Some(endpoint) = cluster.api_endpoint() {
            builder = builder.api_server_address(endpoint.address());
        }
        builder
    }

    /// Cloud provider name
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Network provider selector
    pub fn network_provider(mut self, network_provider: impl Into<String>) -> Self {
        self.network_provider = network_provider.into();
        self
    }

    /// Cloud-config contents
    pub fn cloud_config(mut self, cloud_config: impl Into<String>) -> Self {
        self.cloud_config = Some(cloud_config.into());
        self
    }

    /// Whether a cloud controller manager handles the cloud integration
    pub fn external_provider(mut self, external: bool) -> Self {
        self.external_provider = external;
        self
    }

    /// Add one kubelet flag (without the leading `--`)
    pub fn kubelet_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kubelet_extra_args.insert(key.into(), value.into());
        self
    }

    /// Base kubeadm master configuration document
    pub fn master_configuration(mut self, document: serde_json::Value) -> Self {
        self.master_configuration = Some(document);
        self
    }

    /// API server address nodes join against
    pub fn api_server_address(mut self, address: impl Into<String>) -> Self {
        self.api_server_address = Some(address.into());
        self
    }

    /// Credential material; fields the role does not need are dropped
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Resolve versions and assemble the config
    pub fn build(self, resolver: &VersionResolver) -> Result<ProvisioningConfig> {
        let versions = resolver.resolve(&self.kubernetes_version)?;
        let credentials = self.credentials.for_role(self.role);
        validate_credentials(self.role, &credentials, self.api_server_address.as_deref())?;

        let master_configuration = self
            .master_configuration
            .as_ref()
            .map(|doc| {
                serde_yaml::to_string(doc).map_err(|e| {
                    Error::serialization(format!("failed to serialize master configuration: {e}"))
                })
            })
            .transpose()?;

        Ok(ProvisioningConfig {
            role: self.role,
            packages: package_list(&versions, &self.provider),
            versions,
            kubelet_extra_args: self.kubelet_extra_args,
            cloud_config: self.cloud_config,
            network_provider: self.network_provider,
            provider: self.provider,
            external_provider: self.external_provider,
            api_server_address: self.api_server_address,
            master_configuration,
            credentials,
        })
    }
}

fn missing_credentials(role: MachineRole, credentials: &Credentials) -> Vec<&'static str> {
    let required = match role {
        MachineRole::Master => [
            ("CA key", credentials.ca_key.is_none()),
            ("front proxy CA key", credentials.front_proxy_key.is_none()),
        ],
        MachineRole::Node => [
            ("join token", credentials.kubeadm_token.is_none()),
            ("CA hash", credentials.ca_hash.is_none()),
        ],
    };
    required
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect()
}

fn missing_error(role: MachineRole, missing: &[&str]) -> Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{role} provisioning needs {}",
            missing.join(", ")
        )))
    }
}

fn validate_credentials(
    role: MachineRole,
    credentials: &Credentials,
    api_server_address: Option<&str>,
) -> Result<()> {
    let mut missing = missing_credentials(role, credentials);
    if role == MachineRole::Node && api_server_address.is_none() {
        missing.push("API server address");
    }
    missing_error(role, &missing)
}
