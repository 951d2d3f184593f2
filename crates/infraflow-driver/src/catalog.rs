//! Configuration bundle resolver
//!
//! Bundles live under `<root>/<cloud>/<version>/<kind>`, one directory of
//! declarative config per entity kind, next to an optional `addons/`
//! directory. Every `(cloud, version)` pair is pinned to a tool version in
//! the daemon config; lookups are exact and fail closed.

use crate::error::{DriverError, Result};
use infraflow_config::{BundleConfig, BundleEntry};
use infraflow_core::{CloudType, EntityKind};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A bundle directory and the tool binary that must run it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBundle {
    pub cloud: CloudType,
    pub version: String,
    pub kind: EntityKind,
    pub config_dir: PathBuf,
    /// Post-provisioning manifests (`<root>/<cloud>/<version>/addons`)
    pub addons_dir: PathBuf,
    pub tool_binary: PathBuf,
    pub tool_version: String,
    /// The binary was looked up on PATH, so nothing pins its version yet
    pub verify_tool: bool,
}

#[derive(Debug, Clone)]
pub struct BundleCatalog {
    root: PathBuf,
    tool: String,
    tools_dir: Option<PathBuf>,
    entries: BTreeMap<(CloudType, String), String>,
}

impl BundleCatalog {
    pub fn from_config(config: &BundleConfig) -> Self {
        let entries = config
            .entries
            .iter()
            .map(|BundleEntry { cloud, version, tool_version }| {
                ((*cloud, version.clone()), tool_version.clone())
            })
            .collect();
        Self {
            root: config.root.clone(),
            tool: config.tool.clone(),
            tools_dir: config.tools_dir.clone(),
            entries,
        }
    }

    /// Known versions for a cloud, in order
    pub fn versions(&self, cloud: CloudType) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|(c, _)| *c == cloud)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn resolve(
        &self,
        cloud: CloudType,
        version: &str,
        kind: EntityKind,
    ) -> Result<ResolvedBundle> {
        let unsupported = |reason: String| DriverError::UnsupportedVersion {
            cloud,
            version: version.to_string(),
            kind,
            reason,
        };

        let tool_version = self
            .entries
            .get(&(cloud, version.to_string()))
            .ok_or_else(|| {
                unsupported(format!(
                    "version is not registered (known: {})",
                    self.versions(cloud).join(", ")
                ))
            })?;

        let version_dir = self.root.join(cloud.as_str()).join(version);
        let config_dir = version_dir.join(kind.as_str());
        if !config_dir.is_dir() {
            return Err(unsupported(format!(
                "{} does not exist",
                config_dir.display()
            )));
        }

        let tool_binary = match &self.tools_dir {
            Some(dir) => {
                let binary = dir.join(format!("{}-{}", self.tool, tool_version));
                if !binary.is_file() {
                    return Err(unsupported(format!(
                        "tool binary {} does not exist",
                        binary.display()
                    )));
                }
                binary
            }
            None => PathBuf::from(&self.tool),
        };

        tracing::debug!(
            "Resolved {}/{} {} -> {} (tool {})",
            cloud,
            version,
            kind,
            config_dir.display(),
            tool_version
        );

        Ok(ResolvedBundle {
            cloud,
            version: version.to_string(),
            kind,
            config_dir,
            addons_dir: version_dir.join("addons"),
            tool_binary,
            tool_version: tool_version.clone(),
            verify_tool: self.tools_dir.is_none(),
        })
    }
}
