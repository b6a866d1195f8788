//! Named script fragments
//!
//! Each fragment is a small minijinja template producing one block of shell.
//! Templates only substitute values; which fragments appear, and in what
//! order, is decided in Rust by [`super::ScriptRenderer::plan`].

use serde::Serialize;

/// Pod network add-on installed on the master
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProvider {
    /// flannel (VXLAN backend)
    Flannel,
    /// Calico
    Calico,
    /// Weave Net
    Weavenet,
}

impl NetworkProvider {
    /// Map a cluster's network selector to a provider
    ///
    /// Unknown selectors map to `None`; the script then carries no network
    /// add-on and cluster readiness checks report the missing network.
    pub fn from_selector(selector: &str) -> Option<Self> {
        match selector.trim().to_lowercase().as_str() {
            "flannel" => Some(Self::Flannel),
            "calico" => Some(Self::Calico),
            "weavenet" | "weave" => Some(Self::Weavenet),
            _ => None,
        }
    }

    /// The fragment that installs this add-on
    pub fn fragment(self) -> Fragment {
        match self {
            Self::Flannel => Fragment::Flannel,
            Self::Calico => Fragment::Calico,
            Self::Weavenet => Fragment::Weavenet,
        }
    }
}

/// Every fragment a provisioning script can contain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fragment {
    /// Shell options, logging and the retry helper
    InitScript,
    /// apt repositories and the pinned package install
    InstallPackages,
    /// Replacement kubeadm binary for the 1.8 line
    ForkedKubeadm,
    /// pre-k download pinned to its resolved release
    BootstrapTool,
    /// Host time zone
    PrepareHost,
    /// kubelet drop-in carrying the extra flags, then service start
    KubeletArgs,
    /// CA and front proxy CA key write-out
    SetupCerts,
    /// Cloud-config for the master and cloud controller manager
    MasterCloudConfig,
    /// Base kubeadm master configuration
    BaseMasterConfig,
    /// Merged master config and `kubeadm init`
    ControlPlaneInit,
    /// flannel add-on
    Flannel,
    /// Calico add-on
    Calico,
    /// Weave Net add-on
    Weavenet,
    /// Probe add-on, admin kubeconfig and nginx
    ControlPlaneAddons,
    /// Cloud controller manager for the cluster's provider
    CloudControllerManager,
    /// Cloud-config for nodes of a cluster without an external provider
    NodeCloudConfig,
    /// `kubeadm join` with the supplied token and CA hash
    NodeJoin,
}

impl Fragment {
    /// Every fragment, in script order
    pub const ALL: [Fragment; 17] = [
        Fragment::InitScript,
        Fragment::InstallPackages,
        Fragment::ForkedKubeadm,
        Fragment::BootstrapTool,
        Fragment::PrepareHost,
        Fragment::KubeletArgs,
        Fragment::SetupCerts,
        Fragment::MasterCloudConfig,
        Fragment::BaseMasterConfig,
        Fragment::ControlPlaneInit,
        Fragment::Flannel,
        Fragment::Calico,
        Fragment::Weavenet,
        Fragment::ControlPlaneAddons,
        Fragment::CloudControllerManager,
        Fragment::NodeCloudConfig,
        Fragment::NodeJoin,
    ];

    /// Template name, also used in log output
    pub fn name(self) -> &'static str {
        match self {
            Self::InitScript => "init-script",
            Self::InstallPackages => "install-packages",
            Self::ForkedKubeadm => "forked-kubeadm",
            Self::BootstrapTool => "bootstrap-tool",
            Self::PrepareHost => "prepare-host",
            Self::KubeletArgs => "kubelet-args",
            Self::SetupCerts => "setup-certs",
            Self::MasterCloudConfig => "master-cloud-config",
            Self::BaseMasterConfig => "base-master-config",
            Self::ControlPlaneInit => "control-plane-init",
            Self::Flannel => "flannel",
            Self::Calico => "calico",
            Self::Weavenet => "weavenet",
            Self::ControlPlaneAddons => "control-plane-addons",
            Self::CloudControllerManager => "cloud-controller-manager",
            Self::NodeCloudConfig => "node-cloud-config",
            Self::NodeJoin => "node-join",
        }
    }

    /// Whether this is one of the mutually exclusive network add-ons
    pub fn is_network(self) -> bool {
        matches!(self, Self::Flannel | Self::Calico | Self::Weavenet)
    }

    pub(crate) fn source(self) -> &'static str {
        match self {
            Self::InitScript => INIT_SCRIPT,
            Self::InstallPackages => INSTALL_PACKAGES,
            Self::ForkedKubeadm => FORKED_KUBEADM,
            Self::BootstrapTool => BOOTSTRAP_TOOL,
            Self::PrepareHost => PREPARE_HOST,
            Self::KubeletArgs => KUBELET_ARGS,
            Self::SetupCerts => SETUP_CERTS,
            Self::MasterCloudConfig => MASTER_CLOUD_CONFIG,
            Self::BaseMasterConfig => BASE_MASTER_CONFIG,
            Self::ControlPlaneInit => CONTROL_PLANE_INIT,
            Self::Flannel => FLANNEL,
            Self::Calico => CALICO,
            Self::Weavenet => WEAVENET,
            Self::ControlPlaneAddons => CONTROL_PLANE_ADDONS,
            Self::CloudControllerManager => CLOUD_CONTROLLER_MANAGER,
            Self::NodeCloudConfig => NODE_CLOUD_CONFIG,
            Self::NodeJoin => NODE_JOIN,
        }
    }
}

impl std::fmt::Display for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const INIT_SCRIPT: &str = r#"#!/bin/bash
set -euxo pipefail
exec > >(tee -a /var/log/lattice-deployer.log)
exec 2>&1

export DEBIAN_FRONTEND=noninteractive
export DEBCONF_NONINTERACTIVE_SEEN=true

exec_until_success() {
	$1
	while [ $? -ne 0 ]; do
		sleep 2
		$1
	done
}

# release any apt lock held by unattended upgrades
kill $(ps aux | grep '[a]pt' | awk '{print $2}') || true
"#;

const INSTALL_PACKAGES: &str = r#"# keep package post-install hooks from starting daemons
echo -e '#!/bin/bash\nexit 101' > /usr/sbin/policy-rc.d
chmod +x /usr/sbin/policy-rc.d

apt-get update -y
apt-get install -y apt-transport-https curl ca-certificates software-properties-common tzdata
curl -fsSL --retry 5 {{ sources.package_key_url }} | apt-key add -
echo '{{ sources.package_repository }}' > /etc/apt/sources.list.d/kubernetes.list
exec_until_success 'add-apt-repository -y ppa:gluster/glusterfs-3.10'
apt-get update -y
exec_until_success 'apt-get install -y {{ packages }}'
"#;

const FORKED_KUBEADM: &str = r#"curl -fsSL --retry 5 -o kubeadm {{ sources.forked_kubeadm_url }} \
	&& chmod +x kubeadm \
	&& mv kubeadm /usr/bin/
"#;

const BOOTSTRAP_TOOL: &str = r#"curl -fsSL --retry 5 -o pre-k {{ sources.bootstrap_tool_base_url }}/{{ bootstrap_tool_version }}/pre-k-linux-amd64 \
	&& chmod +x pre-k \
	&& mv pre-k /usr/bin/
"#;

const PREPARE_HOST: &str = r#"timedatectl set-timezone Etc/UTC
"#;

const KUBELET_ARGS: &str = r#"mkdir -p /etc/systemd/system/kubelet.service.d
cat > /etc/systemd/system/kubelet.service.d/20-deployer.conf <<EOF
[Service]
Environment="KUBELET_EXTRA_ARGS={{ kubelet_args }}"
EOF
systemctl daemon-reload
rm -rf /usr/sbin/policy-rc.d
systemctl enable docker kubelet nfs-utils
systemctl start docker kubelet nfs-utils

kubeadm reset
"#;

const SETUP_CERTS: &str = r#"mkdir -p /etc/kubernetes/pki

cat > /etc/kubernetes/pki/ca.key <<EOF
{{ ca_key }}
EOF
pre-k get ca-cert --common-name=ca < /etc/kubernetes/pki/ca.key > /etc/kubernetes/pki/ca.crt

cat > /etc/kubernetes/pki/front-proxy-ca.key <<EOF
{{ front_proxy_key }}
EOF
pre-k get ca-cert --common-name=front-proxy-ca < /etc/kubernetes/pki/front-proxy-ca.key > /etc/kubernetes/pki/front-proxy-ca.crt
chmod 600 /etc/kubernetes/pki/ca.key /etc/kubernetes/pki/front-proxy-ca.key
"#;

const MASTER_CLOUD_CONFIG: &str = r#"mkdir -p /etc/kubernetes/ccm
cat > /etc/kubernetes/ccm/cloud-config <<EOF
{{ cloud_config }}
EOF
"#;

const BASE_MASTER_CONFIG: &str = r#"mkdir -p /etc/kubernetes/kubeadm
cat > /etc/kubernetes/kubeadm/base.yaml <<EOF
{{ master_configuration }}
EOF
"#;

const CONTROL_PLANE_INIT: &str = r#"mkdir -p /etc/kubernetes/kubeadm
touch /etc/kubernetes/kubeadm/base.yaml
pre-k merge master-config \
	--config=/etc/kubernetes/kubeadm/base.yaml \
	--apiserver-advertise-address=$(pre-k machine public-ips --all=false) \
	--apiserver-cert-extra-sans=$(pre-k machine public-ips --routable) \
	--apiserver-cert-extra-sans=$(pre-k machine private-ips) \
	--node-name=${NODE_NAME:-} \
	> /etc/kubernetes/kubeadm/config.yaml
kubeadm init --config=/etc/kubernetes/kubeadm/config.yaml --skip-token-print
"#;

const FLANNEL: &str = r#"kubectl apply \
  -f {{ sources.addons_base_url }}/flannel/v0.9.1/kube-vxlan.yml \
  --kubeconfig /etc/kubernetes/admin.conf
"#;

const CALICO: &str = r#"kubectl apply \
  -f {{ sources.addons_base_url }}/calico/2.6/calico.yaml \
  --kubeconfig /etc/kubernetes/admin.conf
"#;

const WEAVENET: &str = r#"sysctl net.bridge.bridge-nf-call-iptables=1
export kubever=$(kubectl version --kubeconfig /etc/kubernetes/admin.conf | base64 | tr -d '\n')
kubectl apply \
  -f "https://cloud.weave.works/k8s/net?k8s-version=$kubever" \
  --kubeconfig /etc/kubernetes/admin.conf
"#;

const CONTROL_PLANE_ADDONS: &str = r#"kubectl apply \
  -f {{ sources.addons_base_url }}/kubeadm-probe/installer.yaml \
  --kubeconfig /etc/kubernetes/admin.conf

mkdir -p ~/.kube
cp /etc/kubernetes/admin.conf ~/.kube/config
chown $(id -u):$(id -g) ~/.kube/config

apt-get install -y nginx
"#;

const CLOUD_CONTROLLER_MANAGER: &str = r#"cmd='kubectl apply --kubeconfig /etc/kubernetes/admin.conf -f {{ sources.addons_base_url }}/cloud-controller-manager/rbac.yaml'
exec_until_success "$cmd"

cmd='kubectl apply --kubeconfig /etc/kubernetes/admin.conf -f {{ sources.addons_base_url }}/cloud-controller-manager/{{ provider }}/installer.yaml'
exec_until_success "$cmd"

until [ "$(kubectl get pods -n kube-system -l k8s-app=kube-dns -o jsonpath='{.items[0].status.phase}' --kubeconfig /etc/kubernetes/admin.conf)" == "Running" ]
do
	echo '.'
	sleep 5
done
"#;

const NODE_CLOUD_CONFIG: &str = r#"mkdir -p /etc/kubernetes
cat > /etc/kubernetes/cloud-config <<EOF
{{ cloud_config }}
EOF
"#;

const NODE_JOIN: &str = r#"kubeadm join --token={{ kubeadm_token }} --discovery-token-ca-cert-hash={{ ca_hash }} {{ api_server_address }}
"#;
