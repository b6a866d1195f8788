//! Lattice Deployer - cluster bootstrap tooling

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lattice_deployer::crd::{Cluster, Machine};
use lattice_deployer::deployer::{create_client, delete_all_machines, BootstrapTimeouts, KubeObjectStore};
use lattice_deployer::provisioning::{Credentials, ProvisioningConfigBuilder};
use lattice_deployer::script::{ArtifactSources, ScriptRenderer};
use lattice_deployer::token::KubeadmToken;
use lattice_deployer::version::{CompatibilityTable, VersionResolver};

/// Lattice Deployer - bootstraps kubeadm clusters and renders machine provisioning scripts
#[derive(Parser, Debug)]
#[command(name = "lattice-deployer", version, about, long_about = None)]
struct Cli {
    /// Print the Cluster and Machine CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Compatibility table to resolve versions against instead of the built-in one
    #[arg(long, env = "DEPLOYER_COMPATIBILITY_TABLE", global = true)]
    compat: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a Kubernetes version into package pins
    Resolve(ResolveArgs),

    /// Render the provisioning script for one machine
    Render(Box<RenderArgs>),

    /// Generate a kubeadm join token
    Token,

    /// Install the Cluster and Machine CRDs with server-side apply
    InstallCrds(KubeconfigArgs),

    /// Delete every non-master Machine record
    Teardown(KubeconfigArgs),
}

#[derive(Parser, Debug)]
struct ResolveArgs {
    /// Requested Kubernetes version (1.9.2, v1.9, ...)
    version: String,

    /// Cloud provider, used to decide whether the time-sync package is installed
    #[arg(long, env = "DEPLOYER_PROVIDER", default_value = "")]
    provider: String,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Cluster YAML
    #[arg(long)]
    cluster: PathBuf,

    /// Machine YAML
    #[arg(long)]
    machine: PathBuf,

    /// kubeadm join token (nodes)
    #[arg(long, env = "DEPLOYER_TOKEN")]
    token: Option<String>,

    /// Discovery CA cert hash, `sha256:<hex>` (nodes)
    #[arg(long, env = "DEPLOYER_CA_HASH")]
    ca_hash: Option<String>,

    /// CA private key file (masters)
    #[arg(long)]
    ca_key_file: Option<PathBuf>,

    /// Front-proxy CA private key file (masters)
    #[arg(long)]
    front_proxy_key_file: Option<PathBuf>,

    /// API server address nodes join, overriding the Cluster status
    #[arg(long)]
    api_server: Option<String>,

    /// Override the cloud provider named in the Cluster
    #[arg(long, env = "DEPLOYER_PROVIDER")]
    provider: Option<String>,

    /// Base kubeadm master configuration (YAML)
    #[arg(long)]
    master_config: Option<PathBuf>,

    /// Artifact download locations (YAML)
    #[arg(long)]
    sources: Option<PathBuf>,

    /// Write the script here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct KubeconfigArgs {
    /// Kubeconfig of the target cluster
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let cluster = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Cluster CRD: {}", e))?;
        let machine = serde_yaml::to_string(&Machine::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Machine CRD: {}", e))?;
        println!("{cluster}---\n{machine}");
        return Ok(());
    }

    let resolver = load_resolver(cli.compat.as_deref()).await?;

    match cli.command {
        Some(Commands::Resolve(args)) => run_resolve(&resolver, args),
        Some(Commands::Render(args)) => run_render(&resolver, *args).await,
        Some(Commands::Token) => {
            let token = KubeadmToken::generate()?;
            println!("{}", token.as_str());
            Ok(())
        }
        Some(Commands::InstallCrds(args)) => install_crds(&args.kubeconfig).await,
        Some(Commands::Teardown(args)) => run_teardown(&args.kubeconfig).await,
        None => Err(anyhow::anyhow!(
            "no command given, run with --help for usage"
        )),
    }
}

async fn load_resolver(compat: Option<&Path>) -> anyhow::Result<VersionResolver> {
    match compat {
        Some(path) => {
            let table = CompatibilityTable::from_file(path).await?;
            tracing::info!(path = %path.display(), "Loaded compatibility table");
            Ok(VersionResolver::new(Arc::new(table)))
        }
        None => Ok(VersionResolver::default()),
    }
}

fn run_resolve(resolver: &VersionResolver, args: ResolveArgs) -> anyhow::Result<()> {
    let versions = resolver.resolve(&args.version)?;
    let packages = lattice_deployer::provisioning::package_list(&versions, &args.provider);

    print!(
        "{}",
        serde_yaml::to_string(&versions)
            .map_err(|e| anyhow::anyhow!("Failed to serialize versions: {}", e))?
    );
    println!("packages: {}", packages.join(" "));
    Ok(())
}

async fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {} {:?}: {}", what, path, e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {} {:?}: {}", what, path, e))
}

async fn read_optional(path: Option<&Path>) -> anyhow::Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))?,
        )),
        None => Ok(None),
    }
}

async fn run_render(resolver: &VersionResolver, args: RenderArgs) -> anyhow::Result<()> {
    let cluster: Cluster = read_yaml(&args.cluster, "cluster").await?;
    let machine: Machine = read_yaml(&args.machine, "machine").await?;

    let token = match args.token {
        Some(token) => Some(KubeadmToken::supplied(token).into_string()),
        None if !machine.is_master() => {
            let token = KubeadmToken::generate()?;
            tracing::warn!(
                token_id = token.id().unwrap_or_default(),
                "No join token given, generated one; register it on the control plane"
            );
            Some(token.into_string())
        }
        None => None,
    };

    let credentials = Credentials {
        kubeadm_token: token,
        ca_hash: args.ca_hash,
        ca_key: read_optional(args.ca_key_file.as_deref()).await?,
        front_proxy_key: read_optional(args.front_proxy_key_file.as_deref()).await?,
    };

    let mut builder = ProvisioningConfigBuilder::for_machine(&cluster, &machine).credentials(credentials);
    if let Some(provider) = args.provider {
        builder = builder.provider(provider);
    }
    if let Some(address) = args.api_server {
        builder = builder.api_server_address(address);
    }
    if let Some(path) = &args.master_config {
        let document: serde_json::Value = read_yaml(path, "master configuration").await?;
        builder = builder.master_configuration(document);
    }

    let sources = match &args.sources {
        Some(path) => read_yaml::<ArtifactSources>(path, "artifact sources").await?,
        None => ArtifactSources::default(),
    };

    let config = builder.build(resolver)?;
    let script = ScriptRenderer::new(sources).render(&config)?;

    tracing::info!(
        machine = %machine.display_name(),
        role = %config.role,
        fragments = script.fragments().len(),
        digest = %script.digest(),
        "Rendered provisioning script"
    );

    match &args.output {
        Some(path) => tokio::fs::write(path, script.content())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {:?}: {}", path, e))?,
        None => print!("{}", script.content()),
    }
    Ok(())
}

/// Install the Cluster and Machine CRDs
///
/// Server-side apply keeps the installed schema in step with this binary.
async fn install_crds(kubeconfig: &Path) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let client: Client = create_client(kubeconfig).await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("lattice-deployer").force();

    tracing::info!("Installing Cluster CRD...");
    crds.patch("clusters.cluster.k8s.io", &params, &Patch::Apply(&Cluster::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Cluster CRD: {}", e))?;

    tracing::info!("Installing Machine CRD...");
    crds.patch("machines.cluster.k8s.io", &params, &Patch::Apply(&Machine::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Machine CRD: {}", e))?;

    Ok(())
}

async fn run_teardown(kubeconfig: &Path) -> anyhow::Result<()> {
    let client = create_client(kubeconfig).await?;
    let store = KubeObjectStore::new(client);
    let wait = BootstrapTimeouts::default().machine_deletion;

    let deleted = delete_all_machines(&store, &wait).await?;
    tracing::info!(count = deleted.len(), "Teardown complete");
    for name in deleted {
        println!("{name}");
    }
    Ok(())
}
