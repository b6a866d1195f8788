//! In-memory object store
//!
//! Behaves like the API server for the calls the bootstrapper makes:
//! duplicate names are rejected, `generateName` gets a unique suffix, and
//! deletes of missing records succeed. Used for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::clients::ObjectStore;
use crate::crd::{Cluster, Machine};
use crate::{Error, Result};

#[derive(Default)]
struct Records {
    clusters: BTreeMap<String, Cluster>,
    machines: BTreeMap<String, Machine>,
    generated: u64,
}

/// Object store backed by process memory
#[derive(Default)]
pub struct InMemoryObjectStore {
    records: Mutex<Records>,
}

impl InMemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given machines
    pub fn with_machines(machines: impl IntoIterator<Item = Machine>) -> Self {
        let store = Self::new();
        {
            let mut records = store.lock();
            for machine in machines {
                records
                    .machines
                    .insert(machine.display_name().to_string(), machine);
            }
        }
        store
    }

    /// Snapshot of all Machine records, ordered by name
    pub fn machines(&self) -> Vec<Machine> {
        self.lock().machines.values().cloned().collect()
    }

    /// Snapshot of all Cluster records, ordered by name
    pub fn clusters(&self) -> Vec<Cluster> {
        self.lock().clusters.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn assign_name(
    name: Option<&str>,
    generate_name: Option<&str>,
    generated: &mut u64,
    kind: &str,
) -> Result<String> {
    match (name, generate_name) {
        (Some(name), _) if !name.is_empty() => Ok(name.to_string()),
        (_, Some(prefix)) if !prefix.is_empty() => {
            *generated += 1;
            Ok(format!("{prefix}{:05}", *generated))
        }
        _ => Err(Error::validation(format!(
            "{kind} needs a name or generateName"
        ))),
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        let mut records = self.lock();
        let Records {
            clusters,
            generated,
            ..
        } = &mut *records;
        let name = assign_name(
            cluster.metadata.name.as_deref(),
            cluster.metadata.generate_name.as_deref(),
            generated,
            "Cluster",
        )?;
        if clusters.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "Cluster",
                name,
            });
        }
        let mut stored = cluster.clone();
        stored.metadata.name = Some(name.clone());
        clusters.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.lock().clusters.get(name).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters())
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let name = cluster.name_or_empty();
        let mut records = self.lock();
        let stored = records
            .clusters
            .get_mut(name)
            .ok_or_else(|| Error::validation(format!("cluster {name} not found")))?;
        stored.status = cluster.status.clone();
        Ok(stored.clone())
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine> {
        let mut records = self.lock();
        let Records {
            machines,
            generated,
            ..
        } = &mut *records;
        let name = assign_name(
            machine.metadata.name.as_deref(),
            machine.metadata.generate_name.as_deref(),
            generated,
            "Machine",
        )?;
        if machines.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "Machine",
                name,
            });
        }
        let mut stored = machine.clone();
        stored.metadata.name = Some(name.clone());
        machines.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_machine(&self, name: &str) -> Result<Option<Machine>> {
        Ok(self.lock().machines.get(name).cloned())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        Ok(self.machines())
    }

    async fn delete_machine(&self, name: &str) -> Result<()> {
        self.lock().machines.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterSpec, MachineRole, MachineSpec};

    fn node(name: Option<&str>, generate_name: Option<&str>) -> Machine {
        let mut m = Machine::new(
            "",
            MachineSpec {
                role: MachineRole::Node,
                kubernetes_version: "1.9.2".to_string(),
                ..Default::default()
            },
        );
        m.metadata.name = name.map(str::to_string);
        m.metadata.generate_name = generate_name.map(str::to_string);
        m
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = InMemoryObjectStore::new();
        store.create_machine(&node(Some("node-0"), None)).await.unwrap();

        let err = store
            .create_machine(&node(Some("node-0"), None))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn generate_name_gets_unique_suffix() {
        let store = InMemoryObjectStore::new();
        let a = store.create_machine(&node(None, Some("node-"))).await.unwrap();
        let b = store.create_machine(&node(None, Some("node-"))).await.unwrap();

        assert_ne!(a.metadata.name, b.metadata.name);
        assert!(a.display_name().starts_with("node-"));
        assert_eq!(store.list_machines().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn nameless_records_are_invalid() {
        let store = InMemoryObjectStore::new();
        let err = store.create_machine(&node(None, None)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn status_update_requires_existing_cluster() {
        let store = InMemoryObjectStore::new();
        let cluster = Cluster::new("prod", ClusterSpec::default());
        assert!(store.update_cluster_status(&cluster).await.is_err());

        store.create_cluster(&cluster).await.unwrap();
        let mut updated = cluster.clone();
        updated.publish_endpoint(crate::crd::ApiEndpoint::new("35.1.2.3", 443));
        let stored = store.update_cluster_status(&updated).await.unwrap();
        assert_eq!(stored.api_endpoint().unwrap().host, "35.1.2.3");
    }

    #[tokio::test]
    async fn deleting_missing_machine_succeeds() {
        let store = InMemoryObjectStore::with_machines([node(Some("node-0"), None)]);
        store.delete_machine("node-0").await.unwrap();
        store.delete_machine("node-0").await.unwrap();
        assert!(store.get_machine("node-0").await.unwrap().is_none());
    }
}
