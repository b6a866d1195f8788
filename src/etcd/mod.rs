//! Etcd leader/follower assignment for control-plane machines
//!
//! The first master in a bootstrap batch becomes the etcd leader. Masters
//! added later become followers of whichever machine currently holds
//! leadership. This is a single-bootstrapper scheme, not an election: two
//! independent callers racing to create masters are not guarded against,
//! but a store holding more than one leader is refused.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crd::{EtcdSpec, Machine};
use crate::{Error, Result};

/// Etcd topology parameters
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TopologyConfig {
    /// etcd manager image
    pub image: String,
    /// etcd version
    pub version: String,
    /// Bucket prefix for the discovery URI (`gs://<prefix>-<cluster>/discovery`)
    pub discovery_bucket_prefix: String,
    /// Cloud project used in the leader's internal DNS name
    pub project: String,
    /// etcd client port on the leader
    pub client_port: u16,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            image: "sanjid/etcd-manager:latest".to_string(),
            version: "3.2.12".to_string(),
            discovery_bucket_prefix: "pharmer".to_string(),
            project: "k8s-qa".to_string(),
            client_port: 4001,
        }
    }
}

/// Outcome of assigning a later control-plane machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FollowerAssignment {
    /// The machine follows the named leader
    Follower {
        /// Name of the leader machine
        leader: String,
        /// Client endpoint the follower was pointed at
        endpoint: String,
    },
    /// No leader exists; the machine carries no etcd fields
    LeaderMissing,
    /// The machine is not a master and takes no etcd role
    NotControlPlane,
}

impl FollowerAssignment {
    /// True when the machine was created without its etcd role
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::LeaderMissing)
    }
}

/// Assigns etcd roles across control-plane machines
#[derive(Clone, Debug, Default)]
pub struct EtcdTopologyPlanner {
    config: TopologyConfig,
}

impl EtcdTopologyPlanner {
    /// Create a planner with the given topology parameters
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    /// Topology parameters in use
    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Discovery URI for a cluster
    pub fn discovery_uri(&self, cluster_name: &str) -> String {
        format!(
            "gs://{}-{}/discovery",
            self.config.discovery_bucket_prefix, cluster_name
        )
    }

    /// Client endpoint of a leader machine
    pub fn leader_endpoint(&self, leader_name: &str) -> String {
        format!(
            "http://{}.c.{}.internal:{}",
            leader_name, self.config.project, self.config.client_port
        )
    }

    /// Make the first master in the batch the etcd leader
    ///
    /// Returns the index of the leader, or `None` when the batch has no
    /// master. Other machines are left untouched.
    pub fn assign_leader(&self, cluster_name: &str, machines: &mut [Machine]) -> Option<usize> {
        let index = machines.iter().position(Machine::is_master)?;
        let leader = &mut machines[index];
        leader.spec.etcd = Some(EtcdSpec {
            cluster_name: cluster_name.to_string(),
            image_source: self.config.image.clone(),
            discovery: self.discovery_uri(cluster_name),
            is_leader: true,
            version: self.config.version.clone(),
            leader_endpoint: None,
        });
        info!(
            cluster = %cluster_name,
            machine = %leader.display_name(),
            "Assigned etcd leader"
        );
        Some(index)
    }

    /// Find the unique etcd leader among stored machines
    ///
    /// Fails when more than one machine claims leadership.
    pub fn find_leader<'a>(&self, machines: &'a [Machine]) -> Result<Option<&'a Machine>> {
        let mut leaders = machines
            .iter()
            .filter(|m| m.is_master() && m.is_etcd_leader());
        let first = leaders.next();
        if let (Some(a), Some(b)) = (first, leaders.next()) {
            return Err(Error::validation(format!(
                "machines {} and {} both claim etcd leadership",
                a.display_name(),
                b.display_name()
            )));
        }
        Ok(first)
    }

    /// Make a later master follow the current leader
    ///
    /// Without a leader the machine's etcd fields are cleared and
    /// [`FollowerAssignment::LeaderMissing`] is returned so the caller can
    /// surface the degraded machine.
    pub fn assign_follower(&self, leader: Option<&Machine>, machine: &mut Machine) -> FollowerAssignment {
        if !machine.is_master() {
            return FollowerAssignment::NotControlPlane;
        }

        let Some((leader, etcd)) = leader.and_then(|l| l.spec.etcd.as_ref().map(|e| (l, e))) else {
            machine.spec.etcd = None;
            warn!(
                machine = %machine.display_name(),
                "No etcd leader found, creating control-plane machine without etcd role"
            );
            return FollowerAssignment::LeaderMissing;
        };

        let leader_name = leader.display_name().to_string();
        let endpoint = self.leader_endpoint(&leader_name);
        machine.spec.etcd = Some(EtcdSpec {
            cluster_name: etcd.cluster_name.clone(),
            image_source: self.config.image.clone(),
            discovery: etcd.discovery.clone(),
            is_leader: false,
            version: self.config.version.clone(),
            leader_endpoint: Some(endpoint.clone()),
        });
        if let Some(ip) = leader.public_ip() {
            machine.set_public_ip(ip);
        }

        info!(
            machine = %machine.display_name(),
            leader = %leader_name,
            "Assigned etcd follower"
        );
        FollowerAssignment::Follower {
            leader: leader_name,
            endpoint,
        }
    }
}
