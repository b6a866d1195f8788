//! Machine Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{EtcdSpec, MachineRole};

/// Label recording the public IP assigned to a machine
pub const PUBLIC_IP_LABEL: &str = "PublicIP";

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    namespaced,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Role of the machine
    #[serde(default)]
    pub role: MachineRole,

    /// Kubernetes release to install (kubelet, kubectl, kubeadm)
    pub kubernetes_version: String,

    /// Cluster this machine belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Etcd membership (control-plane machines only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<EtcdSpec>,

    /// Extra kubelet flags, without the leading `--`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kubelet_extra_args: BTreeMap<String, String>,
}

impl Machine {
    /// Returns true for control-plane machines
    pub fn is_master(&self) -> bool {
        self.spec.role.is_master()
    }

    /// Returns true when this machine bootstraps etcd
    pub fn is_etcd_leader(&self) -> bool {
        self.spec.etcd.as_ref().is_some_and(|e| e.is_leader)
    }

    /// Name of the machine, falling back to its generateName prefix
    pub fn display_name(&self) -> &str {
        self.metadata
            .name
            .as_deref()
            .or(self.metadata.generate_name.as_deref())
            .unwrap_or_default()
    }

    /// Public IP recorded on the machine, if any
    pub fn public_ip(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(PUBLIC_IP_LABEL))
            .map(String::as_str)
    }

    /// Record the public IP label
    pub fn set_public_ip(&mut self, ip: impl Into<String>) {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(PUBLIC_IP_LABEL.to_string(), ip.into());
    }
}
