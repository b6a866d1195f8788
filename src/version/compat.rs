//! Compatibility table mapping Kubernetes minor releases to companion versions
//!
//! The table is configuration, not code: a default document ships with the
//! crate and a deployment can swap in its own file. Keys are always minor
//! releases (`1.9.0`); patch and pre-release parts are stripped before lookup.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const BUILTIN_TABLE: &str = include_str!("../../config/compatibility.yaml");

static BUILTIN: OnceLock<Arc<CompatibilityTable>> = OnceLock::new();

/// Companion versions pinned for one Kubernetes minor release
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompanionVersions {
    /// kubernetes-cni package version
    pub network_plugin: String,
    /// pre-k bootstrap tool release
    pub bootstrap_tool: String,
}

/// Read-only table of companion versions keyed by minor release
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CompatibilityTable {
    #[serde(default)]
    versions: BTreeMap<String, CompanionVersions>,
}

impl CompatibilityTable {
    /// The table shipped with the deployer, parsed once per process
    ///
    /// # Panics
    ///
    /// Panics if the embedded document is malformed. The document is covered
    /// by unit tests, so this only fires on a broken build.
    pub fn builtin() -> Arc<Self> {
        BUILTIN
            .get_or_init(|| {
                Arc::new(
                    Self::from_yaml(BUILTIN_TABLE)
                        .expect("embedded compatibility table is valid"),
                )
            })
            .clone()
    }

    /// Parse and validate a table document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid compatibility table: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// Load a table document from disk
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!(
                "failed to read compatibility table {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Add or replace an entry, returning the updated table
    pub fn with_entry(
        mut self,
        minor: impl Into<String>,
        network_plugin: impl Into<String>,
        bootstrap_tool: impl Into<String>,
    ) -> Self {
        self.versions.insert(
            minor.into(),
            CompanionVersions {
                network_plugin: network_plugin.into(),
                bootstrap_tool: bootstrap_tool.into(),
            },
        );
        self
    }

    /// Look up the companion versions for a minor release (`1.9.0`)
    pub fn lookup(&self, minor: &str) -> Option<&CompanionVersions> {
        self.versions.get(minor)
    }

    /// Minor releases the table knows about, in sorted order
    pub fn minor_versions(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    fn validate(&self) -> Result<()> {
        for (key, entry) in &self.versions {
            let version = semver::Version::parse(key).map_err(|e| {
                Error::config(format!("compatibility table key {key:?} is not a version: {e}"))
            })?;
            if version.patch != 0 || !version.pre.is_empty() || !version.build.is_empty() {
                return Err(Error::config(format!(
                    "compatibility table key {key:?} must be a minor release like {}.{}.0",
                    version.major, version.minor
                )));
            }
            if entry.network_plugin.is_empty() || entry.bootstrap_tool.is_empty() {
                return Err(Error::config(format!(
                    "compatibility table entry {key} has an empty version"
                )));
            }
        }
        Ok(())
    }
}
