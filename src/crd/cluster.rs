//! Cluster Custom Resource Definition
//!
//! One Cluster record exists per bootstrap run. Its status carries the API
//! endpoints published once the master is reachable.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ApiEndpoint;

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.networkProvider"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cloud provider name (gce, gke, aws, ...)
    pub provider: String,

    /// Pod network provider (flannel, calico, weavenet)
    #[serde(default)]
    pub network_provider: String,

    /// Cloud-config consumed by the kubelet and cloud controller manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_config: Option<String>,

    /// Whether a cloud controller manager runs the cloud integration
    #[serde(default)]
    pub external_cloud_provider: bool,
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// API endpoints of the control plane
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<ApiEndpoint>,
}

impl Cluster {
    /// Name of the cluster, empty when unset
    pub fn name_or_empty(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// First published API endpoint, if any
    pub fn api_endpoint(&self) -> Option<&ApiEndpoint> {
        self.status.as_ref().and_then(|s| s.api_endpoints.first())
    }

    /// Record an API endpoint, ignoring duplicates
    pub fn publish_endpoint(&mut self, endpoint: ApiEndpoint) {
        let status = self.status.get_or_insert_with(ClusterStatus::default);
        if !status.api_endpoints.contains(&endpoint) {
            status.api_endpoints.push(endpoint);
        }
    }
}
