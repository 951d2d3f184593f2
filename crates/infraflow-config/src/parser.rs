//! KDL parsing of `infraflow.kdl`
//!
//! ```kdl
//! controller {
//!     interval "15s"
//!     backoff-base "30s"
//!     backoff-cap "30m"
//!     max-attempts 5
//! }
//! tasks { lease-timeout "10m"; deadline "1h" }
//! worker { count 4 }
//! store { backend "file"; path "/var/lib/infraflow" }
//! bundles {
//!     root "/etc/infraflow/bundles"
//!     tools-dir "/opt/infraflow/tools"
//!     bundle "aws" "v2.3.0" tool-version="1.5.7"
//! }
//! backend "aws" { bucket "infraflow-state"; region "us-west-2"; lock-table "infraflow-locks" }
//! ```

use crate::error::{ConfigError, Result};
use crate::model::{BackendSettings, BundleEntry, DaemonConfig, StoreBackend};
use infraflow_core::CloudType;
use kdl::{KdlDocument, KdlNode};
use std::path::PathBuf;
use std::time::Duration;

pub fn parse_config_str(content: &str) -> Result<DaemonConfig> {
    let doc: KdlDocument = content.parse()?;
    let mut config = DaemonConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "controller" => {
                for child in children(node) {
                    match child.name().value() {
                        "interval" => config.controller.interval = duration(child)?,
                        "backoff-base" => config.controller.backoff_base = duration(child)?,
                        "backoff-cap" => config.controller.backoff_cap = duration(child)?,
                        "max-attempts" => config.controller.max_attempts = integer(child)?,
                        "resync" => config.controller.resync = Some(duration(child)?),
                        other => unknown("controller", other),
                    }
                }
            }
            "tasks" => {
                for child in children(node) {
                    match child.name().value() {
                        "lease-timeout" => config.tasks.lease_timeout = duration(child)?,
                        "deadline" => config.tasks.deadline = duration(child)?,
                        "retention" => config.tasks.retention = duration(child)?,
                        other => unknown("tasks", other),
                    }
                }
            }
            "worker" => {
                for child in children(node) {
                    match child.name().value() {
                        "count" => config.worker.count = integer(child)?,
                        "poll-interval" => config.worker.poll_interval = duration(child)?,
                        "batch" => config.worker.batch = integer(child)?,
                        "heartbeat" => config.worker.heartbeat = duration(child)?,
                        other => unknown("worker", other),
                    }
                }
            }
            "store" => {
                for child in children(node) {
                    match child.name().value() {
                        "backend" => {
                            config.store.backend = match string(child)?.as_str() {
                                "memory" => StoreBackend::Memory,
                                "file" => StoreBackend::File,
                                other => {
                                    return Err(ConfigError::Invalid(format!(
                                        "unknown store backend: {}",
                                        other
                                    )));
                                }
                            }
                        }
                        "path" => config.store.path = PathBuf::from(string(child)?),
                        other => unknown("store", other),
                    }
                }
            }
            "bundles" => {
                for child in children(node) {
                    match child.name().value() {
                        "root" => config.bundles.root = PathBuf::from(string(child)?),
                        "tool" => config.bundles.tool = string(child)?,
                        "tools-dir" => {
                            config.bundles.tools_dir = Some(PathBuf::from(string(child)?))
                        }
                        "bundle" => config.bundles.entries.push(parse_bundle(child)?),
                        other => unknown("bundles", other),
                    }
                }
            }
            "execution" => {
                for child in children(node) {
                    match child.name().value() {
                        "work-dir" => config.execution.work_dir = PathBuf::from(string(child)?),
                        "retain-failed" => config.execution.retain_failed = boolean(child)?,
                        "tail-lines" => config.execution.tail_lines = integer(child)?,
                        "kubectl" => config.execution.kubectl = string(child)?,
                        other => unknown("execution", other),
                    }
                }
            }
            "backend" => {
                let cloud = cloud_arg(node)?;
                config.backends.insert(cloud, parse_backend(node)?);
            }
            "credentials" => {
                for child in children(node) {
                    match child.name().value() {
                        "aws-cli" => config.credentials.aws_cli = string(child)?,
                        "session-duration" => {
                            config.credentials.session_duration = duration(child)?
                        }
                        other => unknown("credentials", other),
                    }
                }
            }
            "server" => {
                for child in children(node) {
                    match child.name().value() {
                        "listen" => config.server.listen = string(child)?,
                        other => unknown("server", other),
                    }
                }
            }
            "deployer" => {
                for child in children(node) {
                    match child.name().value() {
                        "endpoint" => config.deployer.endpoint = Some(string(child)?),
                        other => unknown("deployer", other),
                    }
                }
            }
            other => unknown("top level", other),
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &DaemonConfig) -> Result<()> {
    if config.worker.count == 0 {
        return Err(ConfigError::Invalid("worker count must be at least 1".to_string()));
    }
    if config.worker.batch == 0 {
        return Err(ConfigError::Invalid("worker batch must be at least 1".to_string()));
    }
    if config.worker.heartbeat >= config.tasks.lease_timeout {
        return Err(ConfigError::Invalid(
            "worker heartbeat must be shorter than the lease timeout".to_string(),
        ));
    }
    if config.controller.backoff_base > config.controller.backoff_cap {
        return Err(ConfigError::Invalid(
            "backoff-base exceeds backoff-cap".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for entry in &config.bundles.entries {
        if !seen.insert((entry.cloud, entry.version.as_str())) {
            return Err(ConfigError::Invalid(format!(
                "bundle {}/{} declared twice",
                entry.cloud, entry.version
            )));
        }
    }
    Ok(())
}

fn unknown(section: &str, name: &str) {
    tracing::warn!("Ignoring unknown config node in {}: {}", section, name);
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn string(node: &KdlNode) -> Result<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ConfigError::Invalid(format!("{} expects a string", node.name().value()))
        })
}

fn integer<T: TryFrom<i128>>(node: &KdlNode) -> Result<T> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_integer())
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| {
            ConfigError::Invalid(format!(
                "{} expects a non-negative integer",
                node.name().value()
            ))
        })
}

fn boolean(node: &KdlNode) -> Result<bool> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_bool())
        .ok_or_else(|| ConfigError::Invalid(format!("{} expects #true or #false", node.name().value())))
}

fn duration(node: &KdlNode) -> Result<Duration> {
    let value = string(node)?;
    humantime::parse_duration(&value).map_err(|e| ConfigError::InvalidDuration {
        key: node.name().value().to_string(),
        value,
        message: e.to_string(),
    })
}

fn cloud_arg(node: &KdlNode) -> Result<CloudType> {
    let value = string(node)?;
    value
        .parse::<CloudType>()
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn parse_bundle(node: &KdlNode) -> Result<BundleEntry> {
    let args: Vec<&str> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .collect();
    let [cloud, version] = args.as_slice() else {
        return Err(ConfigError::Invalid(
            "bundle expects <cloud> <version>".to_string(),
        ));
    };
    let tool_version = node
        .get("tool-version")
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            ConfigError::Invalid(format!("bundle {}/{} requires tool-version=", cloud, version))
        })?;

    Ok(BundleEntry {
        cloud: cloud
            .parse::<CloudType>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?,
        version: version.to_string(),
        tool_version: tool_version.to_string(),
    })
}

fn parse_backend(node: &KdlNode) -> Result<BackendSettings> {
    let mut settings = BackendSettings::default();
    for child in children(node) {
        let value = Some(string(child)?);
        match child.name().value() {
            "bucket" => settings.bucket = value,
            "region" => settings.region = value,
            "lock-table" => settings.lock_table = value,
            "resource-group" => settings.resource_group = value,
            "storage-account" => settings.storage_account = value,
            "container" => settings.container = value,
            "key-prefix" => settings.key_prefix = value,
            other => unknown("backend", other),
        }
    }
    Ok(settings)
}
