//! Kubernetes version resolution
//!
//! Turns a requested Kubernetes version into the exact package pins a machine
//! installs: the patch release for kubelet/kubectl/kubeadm, and the
//! companion versions recorded for its minor release.

mod compat;

pub use compat::{CompanionVersions, CompatibilityTable};

use std::sync::Arc;

use serde::Serialize;

use crate::{Error, Result};

/// The one minor release that needs the forked kubeadm binary
///
/// kubeadm 1.8.x lacks <https://github.com/kubernetes/kubernetes/pull/49840>.
/// This is a point fix for that release only, never a range.
pub const FORKED_KUBEADM_MINOR: &str = "1.8.0";

/// Component name reported when the network plugin version is unknown
pub const NETWORK_PLUGIN_COMPONENT: &str = "kubernetes-cni";

/// Component name reported when the bootstrap tool version is unknown
pub const BOOTSTRAP_TOOL_COMPONENT: &str = "pre-k";

/// Every version a machine needs, resolved from one requested version
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVersions {
    /// The version as requested
    pub requested: String,
    /// `major.minor.patch` without pre-release or build metadata
    pub patch: String,
    /// `major.minor.0`
    pub minor: String,
    /// kubernetes-cni package version
    pub network_plugin: String,
    /// pre-k bootstrap tool release
    pub bootstrap_tool: String,
}

impl ResolvedVersions {
    /// Whether the forked kubeadm binary must replace the packaged one
    pub fn uses_forked_kubeadm(&self) -> bool {
        self.minor == FORKED_KUBEADM_MINOR
    }
}

/// Parse a release version, rejecting pre-releases
///
/// A leading `v` is accepted and missing components are zero-filled, so
/// `v1.9` parses as `1.9.0`. Build metadata is dropped.
pub fn parse_release(version: &str) -> Result<semver::Version> {
    let mut parsed =
        semver::Version::parse(&normalize(version)).map_err(|e| Error::InvalidVersion {
            version: version.to_string(),
            reason: e.to_string(),
        })?;

    if !parsed.pre.is_empty() {
        return Err(Error::UnsupportedVersion(version.to_string()));
    }
    parsed.build = semver::BuildMetadata::EMPTY;
    Ok(parsed)
}

fn normalize(version: &str) -> String {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);

    let mut core = core.to_string();
    for _ in core.split('.').count()..3 {
        core.push_str(".0");
    }
    format!("{core}{suffix}")
}

/// Resolves versions against an injected compatibility table
#[derive(Clone, Debug)]
pub struct VersionResolver {
    table: Arc<CompatibilityTable>,
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new(CompatibilityTable::builtin())
    }
}

impl VersionResolver {
    /// Create a resolver over the given table
    pub fn new(table: Arc<CompatibilityTable>) -> Self {
        Self { table }
    }

    /// The table this resolver reads
    pub fn table(&self) -> &CompatibilityTable {
        &self.table
    }

    /// Resolve the patch and minor forms plus all companion versions
    pub fn resolve(&self, version: &str) -> Result<ResolvedVersions> {
        let parsed = parse_release(version)?;
        let minor = format!("{}.{}.0", parsed.major, parsed.minor);
        let companions = self.companions(version, &minor)?;

        Ok(ResolvedVersions {
            requested: version.to_string(),
            patch: format!("{}.{}.{}", parsed.major, parsed.minor, parsed.patch),
            minor,
            network_plugin: companions.network_plugin.clone(),
            bootstrap_tool: companions.bootstrap_tool.clone(),
        })
    }

    /// kubernetes-cni version for the requested Kubernetes version
    pub fn network_plugin_version(&self, version: &str) -> Result<String> {
        let minor = minor_of(version)?;
        self.table
            .lookup(&minor)
            .map(|c| c.network_plugin.clone())
            .ok_or_else(|| Error::UnknownCompatibleVersion {
                component: NETWORK_PLUGIN_COMPONENT,
                version: version.to_string(),
            })
    }

    /// pre-k release for the requested Kubernetes version
    pub fn bootstrap_tool_version(&self, version: &str) -> Result<String> {
        let minor = minor_of(version)?;
        self.table
            .lookup(&minor)
            .map(|c| c.bootstrap_tool.clone())
            .ok_or_else(|| Error::UnknownCompatibleVersion {
                component: BOOTSTRAP_TOOL_COMPONENT,
                version: version.to_string(),
            })
    }

    /// Whether the requested version needs the forked kubeadm binary
    pub fn uses_forked_kubeadm(&self, version: &str) -> Result<bool> {
        Ok(minor_of(version)? == FORKED_KUBEADM_MINOR)
    }

    fn companions(&self, version: &str, minor: &str) -> Result<&CompanionVersions> {
        self.table
            .lookup(minor)
            .ok_or_else(|| Error::UnknownCompatibleVersion {
                component: NETWORK_PLUGIN_COMPONENT,
                version: version.to_string(),
            })
    }
}

fn minor_of(version: &str) -> Result<String> {
    let parsed = parse_release(version)?;
    Ok(format!("{}.{}.0", parsed.major, parsed.minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> VersionResolver {
        VersionResolver::default()
    }

    // =========================================================================
    // Story: release versions resolve to exact pins
    // =========================================================================

    #[test]
    fn story_every_table_entry_resolves_to_its_pins() {
        let resolver = resolver();
        let minors: Vec<String> = resolver.table().minor_versions().map(String::from).collect();

        for minor in minors {
            let expected = resolver.table().lookup(&minor).unwrap().clone();
            let resolved = resolver.resolve(&minor).unwrap();
            assert_eq!(resolved.minor, minor);
            assert_eq!(resolved.network_plugin, expected.network_plugin);
            assert_eq!(resolved.bootstrap_tool, expected.bootstrap_tool);
        }
    }

    #[test]
    fn story_patch_release_strips_to_minor_for_lookup() {
        let resolved = resolver().resolve("1.9.2").unwrap();
        assert_eq!(resolved.requested, "1.9.2");
        assert_eq!(resolved.patch, "1.9.2");
        assert_eq!(resolved.minor, "1.9.0");
        assert_eq!(resolved.network_plugin, "0.6.0");
        assert_eq!(resolved.bootstrap_tool, "1.9.0-rc.0");
    }

    #[test]
    fn story_build_metadata_and_prefix_are_dropped() {
        let resolved = resolver().resolve("v1.10.1+gke.3").unwrap();
        assert_eq!(resolved.patch, "1.10.1");
        assert_eq!(resolved.minor, "1.10.0");
    }

    #[test]
    fn short_versions_are_zero_filled() {
        assert_eq!(parse_release("1.9").unwrap().to_string(), "1.9.0");
        assert_eq!(parse_release("v1").unwrap().to_string(), "1.0.0");
    }

    // =========================================================================
    // Story: anything but a known release is a hard error
    // =========================================================================

    #[test]
    fn story_unknown_minor_never_defaults() {
        for version in ["1.7.4", "1.11.0", "2.0.0"] {
            match resolver().resolve(version) {
                Err(Error::UnknownCompatibleVersion {
                    component,
                    version: v,
                }) => {
                    assert_eq!(component, NETWORK_PLUGIN_COMPONENT);
                    assert_eq!(v, version);
                }
                other => panic!("expected UnknownCompatibleVersion for {version}, got {other:?}"),
            }
        }
    }

    #[test]
    fn story_pre_releases_are_rejected() {
        for version in ["1.9.0-alpha.1", "1.9.0-beta.0", "v1.10.0-rc.1", "1.9-rc.1"] {
            assert!(
                matches!(resolver().resolve(version), Err(Error::UnsupportedVersion(_))),
                "{version} should be rejected"
            );
            assert!(matches!(
                resolver().bootstrap_tool_version(version),
                Err(Error::UnsupportedVersion(_))
            ));
        }
    }

    #[test]
    fn malformed_versions_are_invalid() {
        for version in ["", "latest", "1.9.x", "1.9.2.1"] {
            assert!(
                matches!(parse_release(version), Err(Error::InvalidVersion { .. })),
                "{version:?} should be invalid"
            );
        }
    }

    #[test]
    fn component_lookups_name_their_component() {
        let err = resolver().bootstrap_tool_version("1.7.0").unwrap_err();
        assert!(err.to_string().contains(BOOTSTRAP_TOOL_COMPONENT));
        assert!(err.to_string().contains("1.7.0"));

        assert_eq!(resolver().network_plugin_version("1.8.3").unwrap(), "0.5.1");
        assert_eq!(resolver().bootstrap_tool_version("1.10.4").unwrap(), "1.9.0-rc.0");
    }

    // =========================================================================
    // Story: the forked kubeadm predicate is a single point fix
    // =========================================================================

    #[test]
    fn story_forked_kubeadm_only_for_one_eight() {
        let resolver = resolver();
        assert!(resolver.uses_forked_kubeadm("1.8.3").unwrap());
        assert!(resolver.uses_forked_kubeadm("1.8.0").unwrap());
        assert!(!resolver.uses_forked_kubeadm("1.9.0").unwrap());
        assert!(!resolver.uses_forked_kubeadm("1.7.9").unwrap());
        assert!(!resolver.uses_forked_kubeadm("1.80.0").unwrap());

        assert!(resolver.resolve("1.8.3").unwrap().uses_forked_kubeadm());
        assert!(!resolver.resolve("1.10.0").unwrap().uses_forked_kubeadm());
    }

    #[test]
    fn injected_table_overrides_builtin() {
        let table = CompatibilityTable::default().with_entry("1.11.0", "0.7.5", "1.11.0");
        let resolver = VersionResolver::new(Arc::new(table));

        let resolved = resolver.resolve("1.11.2").unwrap();
        assert_eq!(resolved.network_plugin, "0.7.5");
        assert!(resolver.resolve("1.9.2").is_err());
    }
}
