//! Supporting types for the Cluster and Machine resources

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role a machine plays in the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    /// Control-plane machine running the API server and etcd
    Master,
    /// Worker machine that joins an existing control plane
    #[default]
    Node,
}

impl MachineRole {
    /// Returns true for control-plane machines
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

impl std::str::FromStr for MachineRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "node" => Ok(Self::Node),
            _ => Err(crate::Error::validation(format!(
                "invalid machine role: {s}, expected one of: master, node"
            ))),
        }
    }
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// Etcd membership descriptor for a control-plane machine
///
/// Exactly one machine per cluster carries `is_leader = true`; followers
/// point `leader_endpoint` at that machine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// Etcd cluster identifier
    pub cluster_name: String,

    /// Etcd (manager) image reference
    pub image_source: String,

    /// Discovery URI new peers use to find the etcd cluster
    pub discovery: String,

    /// Whether this member bootstraps the etcd cluster
    #[serde(default)]
    pub is_leader: bool,

    /// Etcd version
    pub version: String,

    /// Client endpoint of the leader (absent on the leader itself)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_endpoint: Option<String>,
}

/// A published API server endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Host name or IP address
    pub host: String,
    /// Port
    pub port: u16,
}

impl ApiEndpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used by `kubeadm join`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// HTTPS URL of the endpoint
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}
