//! Provisioning script rendering
//!
//! A script is an ordered concatenation of named [`Fragment`]s. Master and
//! node scripts share every fragment up to the kubelet setup; after that the
//! role decides:
//!
//! - master: certificates, optional cloud-config and base configuration,
//!   `kubeadm init`, exactly one network add-on (or none for an unknown
//!   selector), control-plane add-ons, and the cloud controller manager
//!   when the provider is external
//! - node: optional cloud-config, then `kubeadm join`
//!
//! Rendering is a pure function of the [`ProvisioningConfig`]: the same
//! config always yields byte-identical output.

mod fragments;

pub use fragments::{Fragment, NetworkProvider};

use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crd::MachineRole;
use crate::provisioning::ProvisioningConfig;
use crate::Result;

/// Download locations referenced by rendered scripts
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArtifactSources {
    /// Signing key for the Kubernetes apt repository
    pub package_key_url: String,
    /// apt source line for the Kubernetes packages
    pub package_repository: String,
    /// Forked kubeadm binary for the 1.8 line
    pub forked_kubeadm_url: String,
    /// Base URL of pre-k releases; the version and file name are appended
    pub bootstrap_tool_base_url: String,
    /// Base URL of the add-on manifests
    pub addons_base_url: String,
}

impl Default for ArtifactSources {
    fn default() -> Self {
        Self {
            package_key_url: "https://packages.cloud.google.com/apt/doc/apt-key.gpg".to_string(),
            package_repository: "deb http://apt.kubernetes.io/ kubernetes-xenial main".to_string(),
            forked_kubeadm_url:
                "https://github.com/appscode/kubernetes/releases/download/v1.8.3/kubeadm"
                    .to_string(),
            bootstrap_tool_base_url: "https://cdn.appscode.com/binaries/pre-k".to_string(),
            addons_base_url: "https://raw.githubusercontent.com/pharmer/addons/master".to_string(),
        }
    }
}

/// A rendered script plus the fragments it was built from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningScript {
    role: MachineRole,
    fragments: Vec<Fragment>,
    content: String,
}

impl ProvisioningScript {
    /// Role the script provisions
    pub fn role(&self) -> MachineRole {
        self.role
    }

    /// Fragments in script order
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Whether the script includes the given fragment
    pub fn contains_fragment(&self, fragment: Fragment) -> bool {
        self.fragments.contains(&fragment)
    }

    /// The script text
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Consume the script, returning its text
    pub fn into_content(self) -> String {
        self.content
    }

    /// Hex SHA-256 of the script text, stable across identical renders
    pub fn digest(&self) -> String {
        use aws_lc_rs::digest;
        let hash = digest::digest(&digest::SHA256, self.content.as_bytes());
        hash.as_ref()
            .iter()
            .fold(String::with_capacity(64), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }
}

impl std::fmt::Display for ProvisioningScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.content)
    }
}

/// Values a fragment may reference
#[derive(Serialize)]
struct FragmentContext<'a> {
    sources: &'a ArtifactSources,
    packages: String,
    bootstrap_tool_version: &'a str,
    kubelet_args: String,
    provider: &'a str,
    cloud_config: &'a str,
    master_configuration: &'a str,
    ca_key: &'a str,
    front_proxy_key: &'a str,
    kubeadm_token: &'a str,
    ca_hash: &'a str,
    api_server_address: &'a str,
}

impl<'a> FragmentContext<'a> {
    fn new(config: &'a ProvisioningConfig, sources: &'a ArtifactSources) -> Self {
        let creds = &config.credentials;
        Self {
            sources,
            packages: config.package_list(),
            bootstrap_tool_version: config.bootstrap_tool_version(),
            kubelet_args: config.kubelet_extra_args_str(),
            provider: &config.provider,
            cloud_config: config.cloud_config.as_deref().unwrap_or_default(),
            master_configuration: config.master_configuration.as_deref().unwrap_or_default(),
            ca_key: creds.ca_key.as_deref().unwrap_or_default(),
            front_proxy_key: creds.front_proxy_key.as_deref().unwrap_or_default(),
            kubeadm_token: creds.kubeadm_token.as_deref().unwrap_or_default(),
            ca_hash: creds.ca_hash.as_deref().unwrap_or_default(),
            api_server_address: config.api_server_address.as_deref().unwrap_or_default(),
        }
    }
}

/// Renders provisioning scripts from named fragments
pub struct ScriptRenderer {
    env: Environment<'static>,
    sources: ArtifactSources,
}

impl Default for ScriptRenderer {
    fn default() -> Self {
        Self::new(ArtifactSources::default())
    }
}

impl std::fmt::Debug for ScriptRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRenderer")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl ScriptRenderer {
    /// Create a renderer using the given download locations
    ///
    /// # Panics
    ///
    /// Panics if a built-in fragment fails to compile. Fragments are static
    /// and covered by tests, so this only fires on a broken build.
    pub fn new(sources: ArtifactSources) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for fragment in Fragment::ALL {
            env.add_template(fragment.name(), fragment.source())
                .expect("built-in script fragments are valid templates");
        }
        Self { env, sources }
    }

    /// Download locations used by this renderer
    pub fn sources(&self) -> &ArtifactSources {
        &self.sources
    }

    /// Fragments a config renders to, in order
    pub fn plan(config: &ProvisioningConfig) -> Vec<Fragment> {
        let mut plan = vec![Fragment::InitScript, Fragment::InstallPackages];
        if config.uses_forked_kubeadm() {
            plan.push(Fragment::ForkedKubeadm);
        }
        plan.extend([
            Fragment::BootstrapTool,
            Fragment::PrepareHost,
            Fragment::KubeletArgs,
        ]);

        match config.role {
            MachineRole::Master => plan.extend(master_fragments(config)),
            MachineRole::Node => plan.extend(node_fragments(config)),
        }
        plan
    }

    /// Render the script for a config
    pub fn render(&self, config: &ProvisioningConfig) -> Result<ProvisioningScript> {
        let fragments = Self::plan(config);
        let ctx = FragmentContext::new(config, &self.sources);

        let blocks = fragments
            .iter()
            .map(|fragment| self.env.get_template(fragment.name())?.render(&ctx))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(
            role = %config.role,
            version = %config.versions.patch,
            fragments = fragments.len(),
            "Rendered provisioning script"
        );

        Ok(ProvisioningScript {
            role: config.role,
            fragments,
            content: blocks.join("\n"),
        })
    }
}

fn master_fragments(config: &ProvisioningConfig) -> Vec<Fragment> {
    let mut plan = vec![Fragment::SetupCerts];
    if config.cloud_config.is_some() {
        plan.push(Fragment::MasterCloudConfig);
    }
    if config.master_configuration.is_some() {
        plan.push(Fragment::BaseMasterConfig);
    }
    plan.push(Fragment::ControlPlaneInit);

    match NetworkProvider::from_selector(&config.network_provider) {
        Some(network) => plan.push(network.fragment()),
        None => debug!(
            selector = %config.network_provider,
            "Unknown network provider, rendering no network add-on"
        ),
    }

    plan.push(Fragment::ControlPlaneAddons);
    if config.external_provider {
        plan.push(Fragment::CloudControllerManager);
    }
    plan
}

fn node_fragments(config: &ProvisioningConfig) -> Vec<Fragment> {
    let mut plan = Vec::new();
    if !config.external_provider && config.cloud_config.is_some() {
        plan.push(Fragment::NodeCloudConfig);
    }
    plan.push(Fragment::NodeJoin);
    plan
}
