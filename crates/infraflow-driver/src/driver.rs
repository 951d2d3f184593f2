//! Execution driver
//!
//! One [`Driver`] owns one working directory holding a copy of a bundle for
//! one entity version. The directory is never shared: every execution gets
//! a fresh `<work-dir>/<entity>/<hash>-<uuid>` directory.
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──apply──▶ Applied
//!                              │  ▲                  │
//!                              │  └──────init────────┘
//!                              └──destroy──▶ Destroyed
//!             (any failing command) ──▶ Failed
//! ```

use crate::catalog::ResolvedBundle;
use crate::error::{DriverError, Result};
use crate::process::{self, Captured, Invocation};
use chrono::{DateTime, Utc};
use infraflow_cloud::VarArg;
use infraflow_config::ExecutionConfig;
use infraflow_core::{Entity, OutputValue, Outputs};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of a working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Uninitialized,
    Initialized,
    Applied,
    Destroyed,
    Failed,
}

impl std::fmt::Display for StackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackState::Uninitialized => write!(f, "uninitialized"),
            StackState::Initialized => write!(f, "initialized"),
            StackState::Applied => write!(f, "applied"),
            StackState::Destroyed => write!(f, "destroyed"),
            StackState::Failed => write!(f, "failed"),
        }
    }
}

/// Arguments built by the variable provider
#[derive(Debug, Clone, Default)]
pub struct StackArgs {
    pub vars: Vec<VarArg>,
    pub backend: Vec<VarArg>,
    pub credentials: Vec<VarArg>,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub work_dir: PathBuf,
    pub tail_lines: usize,
}

impl From<&ExecutionConfig> for DriverSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            tail_lines: config.tail_lines,
        }
    }
}

/// Result of `plan`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub plan_file: PathBuf,
    pub has_changes: bool,
}

/// Parsed `output -json`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackOutputs {
    pub values: Outputs,
    /// Names of outputs the bundle marked sensitive
    pub sensitive: BTreeSet<String>,
}

impl StackOutputs {
    /// Outputs safe to store on entity status
    pub fn public(&self) -> Outputs {
        self.values
            .iter()
            .filter(|(name, _)| !self.sensitive.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(OutputValue::as_str)
    }
}

pub struct Driver {
    entity_id: String,
    bundle: ResolvedBundle,
    dir: PathBuf,
    args: StackArgs,
    state: StackState,
    deadline: Instant,
    tail_lines: usize,
}

impl Driver {
    /// Copy the bundle into a fresh working directory
    pub async fn prepare(
        settings: &DriverSettings,
        bundle: ResolvedBundle,
        entity: &Entity,
        args: StackArgs,
        deadline: DateTime<Utc>,
    ) -> Result<Self> {
        let hash = entity.spec.hash();
        let dir = settings
            .work_dir
            .join(&entity.id)
            .join(format!("{}-{}", &hash[..12], Uuid::new_v4()));

        let source = bundle.config_dir.clone();
        let target = dir.clone();
        let copied = tokio::task::spawn_blocking(move || copy_dir(&source, &target))
            .await
            .map_err(std::io::Error::other)
            .and_then(|copied| copied);
        if let Err(e) = copied {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!("{}: could not remove {}: {}", entity.id, dir.display(), cleanup);
            }
            return Err(DriverError::Io(e));
        }

        tracing::debug!("{}: prepared stack at {}", entity.id, dir.display());

        Ok(Self {
            entity_id: entity.id.clone(),
            bundle,
            dir,
            args,
            state: StackState::Uninitialized,
            deadline: to_instant(deadline),
            tail_lines: settings.tail_lines,
        })
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    pub fn work_dir(&self) -> &Path {
        &self.dir
    }

    pub fn bundle(&self) -> &ResolvedBundle {
        &self.bundle
    }

    /// Initialise providers and the remote backend. Safe to repeat.
    pub async fn init(&mut self) -> Result<()> {
        self.require(
            "init",
            &[
                StackState::Uninitialized,
                StackState::Initialized,
                StackState::Applied,
            ],
        )?;
        if self.state == StackState::Uninitialized && self.bundle.verify_tool {
            self.verify_tool_version().await?;
        }

        let mut args = vec![
            "init".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-reconfigure".to_string(),
        ];
        args.extend(
            self.args
                .backend
                .iter()
                .map(|b| format!("-backend-config={}={}", b.key, b.value)),
        );

        let captured = self.execute("init", args).await?;
        self.check(&captured, "init")?;
        self.state = StackState::Initialized;
        Ok(())
    }

    /// Compute a diff without touching infrastructure
    pub async fn plan(&mut self, plan_id: &str) -> Result<PlanSummary> {
        self.require("plan", &[StackState::Initialized, StackState::Applied])?;

        let plan_file = self.dir.join(format!("{}.tfplan", plan_id));
        let mut args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-detailed-exitcode".to_string(),
            format!("-out={}", plan_file.display()),
        ];
        args.extend(self.var_flags());

        let captured = self.execute("plan", args).await?;
        // -detailed-exitcode: 0 = no changes, 2 = changes present
        match captured.code {
            0 | 2 => Ok(PlanSummary {
                plan_file,
                has_changes: captured.code == 2,
            }),
            _ => Err(self.fail(&captured, "plan")),
        }
    }

    /// Init, then apply with auto-approval
    pub async fn apply(&mut self) -> Result<()> {
        self.init().await?;
        self.require("apply", &[StackState::Initialized])?;

        let mut args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
        ];
        args.extend(self.var_flags());

        let captured = self.execute("apply", args).await?;
        self.check(&captured, "apply")?;
        self.state = StackState::Applied;
        tracing::info!("{}: apply complete", self.entity_id);
        Ok(())
    }

    /// Init, then destroy with auto-approval
    pub async fn destroy(&mut self) -> Result<()> {
        self.init().await?;
        self.require("destroy", &[StackState::Initialized])?;

        let mut args = vec![
            "destroy".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
        ];
        args.extend(self.var_flags());

        let captured = self.execute("destroy", args).await?;
        self.check(&captured, "destroy")?;
        self.state = StackState::Destroyed;
        tracing::info!("{}: destroy complete", self.entity_id);
        Ok(())
    }

    /// Read the stack's outputs
    pub async fn output(&mut self) -> Result<StackOutputs> {
        self.require("read outputs of", &[StackState::Initialized, StackState::Applied])?;

        let args = vec!["output".to_string(), "-json".to_string(), "-no-color".to_string()];
        let captured = self.execute("output", args).await?;
        self.check(&captured, "output")?;
        parse_outputs(&captured.stdout)
    }

    /// Release the working directory. Returns the path when it was kept.
    pub async fn close(self, retain: bool) -> Result<Option<PathBuf>> {
        if retain {
            tracing::info!(
                "{}: keeping working directory {} ({})",
                self.entity_id,
                self.dir.display(),
                self.state
            );
            return Ok(Some(self.dir));
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_tool_version(&mut self) -> Result<()> {
        let args = vec!["version".to_string(), "-json".to_string()];
        let captured = self.execute("version", args).await?;
        self.check(&captured, "version")?;
        let found = parse_tool_version(&captured.stdout)?;
        if found != self.bundle.tool_version {
            self.state = StackState::Failed;
            return Err(DriverError::UnsupportedVersion {
                cloud: self.bundle.cloud,
                version: self.bundle.version.clone(),
                kind: self.bundle.kind,
                reason: format!(
                    "{} is version {}, the bundle is pinned to {}",
                    self.bundle.tool_binary.display(),
                    found,
                    self.bundle.tool_version
                ),
            });
        }
        tracing::debug!("{}: tool version {} verified", self.entity_id, found);
        Ok(())
    }

    fn require(&self, operation: &'static str, allowed: &[StackState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DriverError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Non-sensitive variables go on the command line
    fn var_flags(&self) -> Vec<String> {
        self.args
            .vars
            .iter()
            .chain(&self.args.credentials)
            .filter(|v| !v.sensitive)
            .map(|v| format!("-var={}={}", v.key, v.value))
            .collect()
    }

    /// Sensitive variables go through `TF_VAR_*`
    fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("TF_IN_AUTOMATION".to_string(), "1".to_string()),
            ("TF_INPUT".to_string(), "0".to_string()),
        ];
        env.extend(
            self.args
                .vars
                .iter()
                .chain(&self.args.credentials)
                .filter(|v| v.sensitive)
                .map(|v| (format!("TF_VAR_{}", v.key), v.value.clone())),
        );
        env
    }

    async fn execute(&mut self, subcommand: &str, args: Vec<String>) -> Result<Captured> {
        let label = format!(
            "{} {}",
            self.bundle
                .tool_binary
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            subcommand
        );
        tracing::debug!(
            "{}: running {} (vars: {})",
            self.entity_id,
            label,
            self.var_keys().join(", ")
        );

        let invocation = Invocation {
            program: &self.bundle.tool_binary,
            args,
            env: self.env(),
            cwd: &self.dir,
            label,
        };
        let result = process::run(invocation, self.deadline).await;
        if result.is_err() {
            self.state = StackState::Failed;
        }
        result
    }

    fn check(&mut self, captured: &Captured, subcommand: &str) -> Result<()> {
        if captured.success() {
            Ok(())
        } else {
            Err(self.fail(captured, subcommand))
        }
    }

    fn fail(&mut self, captured: &Captured, subcommand: &str) -> DriverError {
        self.state = StackState::Failed;
        tracing::warn!(
            "{}: {} exited with code {}",
            self.entity_id,
            subcommand,
            captured.code
        );
        DriverError::Execution {
            command: subcommand.to_string(),
            code: captured.code,
            tail: captured.tail(self.tail_lines),
        }
    }

    fn var_keys(&self) -> Vec<&str> {
        self.args
            .vars
            .iter()
            .chain(&self.args.credentials)
            .map(|v| v.key.as_str())
            .collect()
    }
}

fn to_instant(deadline: DateTime<Utc>) -> Instant {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
    Instant::now() + remaining
}

/// `version -json` reports `{"terraform_version": "1.7.5", ...}`
fn parse_tool_version(raw: &str) -> Result<String> {
    let parsed: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|e| DriverError::OutputParse(format!("version: invalid JSON: {}", e)))?;
    parsed
        .get("terraform_version")
        .and_then(|v| v.as_str())
        .map(|v| v.trim_start_matches('v').to_string())
        .ok_or_else(|| DriverError::OutputParse("version: no terraform_version".to_string()))
}

/// Parse `output -json`: `{"name": {"value": ..., "sensitive": bool, "type": ...}}`
pub fn parse_outputs(raw: &str) -> Result<StackOutputs> {
    let parsed: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|e| DriverError::OutputParse(format!("invalid JSON: {}", e)))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| DriverError::OutputParse("expected a JSON object".to_string()))?;

    let mut outputs = StackOutputs::default();
    for (name, entry) in object {
        let value = entry.get("value").ok_or_else(|| {
            DriverError::OutputParse(format!("output {} has no value", name))
        })?;
        if entry.get("sensitive").and_then(|s| s.as_bool()) == Some(true) {
            outputs.sensitive.insert(name.clone());
        }
        if let Some(value) = to_output_value(value) {
            outputs.values.insert(name.clone(), value);
        }
    }
    Ok(outputs)
}

/// Scalars become strings; `null` is dropped
fn to_output_value(value: &serde_json::Value) -> Option<OutputValue> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::String(s) => Some(OutputValue::String(s.clone())),
        Value::Bool(b) => Some(OutputValue::String(b.to_string())),
        Value::Number(n) => Some(OutputValue::String(n.to_string())),
        Value::Array(items) => Some(OutputValue::List(
            items.iter().filter_map(to_output_value).collect(),
        )),
        Value::Object(map) => Some(OutputValue::Object(
            map.iter()
                .filter_map(|(k, v)| to_output_value(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
    }
}

/// Recursive copy that skips tool caches
fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".terraform" {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            copy_dir(&path, &target.join(&name))?;
        } else {
            std::fs::copy(&path, target.join(&name))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outputs() {
        let raw = r#"{
            "vpc_id": {"sensitive": false, "type": "string", "value": "vpc-123"},
            "subnet_ids": {"sensitive": false, "type": ["list", "string"], "value": ["a", "b"]},
            "node_count": {"sensitive": false, "type": "number", "value": 3},
            "cluster_token": {"sensitive": true, "type": "string", "value": "t0k3n"},
            "unset": {"sensitive": false, "type": "string", "value": null}
        }"#;
        let outputs = parse_outputs(raw).unwrap();

        assert_eq!(outputs.string("vpc_id"), Some("vpc-123"));
        assert_eq!(outputs.string("node_count"), Some("3"));
        assert_eq!(
            outputs.values["subnet_ids"].as_string_list(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(!outputs.values.contains_key("unset"));

        let public = outputs.public();
        assert!(public.contains_key("vpc_id"));
        assert!(!public.contains_key("cluster_token"));
    }

    #[test]
    fn test_parse_outputs_rejects_malformed() {
        assert!(matches!(
            parse_outputs("not json"),
            Err(DriverError::OutputParse(_))
        ));
        assert!(matches!(
            parse_outputs(r#"["vpc-123"]"#),
            Err(DriverError::OutputParse(_))
        ));
        assert!(matches!(
            parse_outputs(r#"{"vpc_id": "vpc-123"}"#),
            Err(DriverError::OutputParse(_))
        ));
    }

    #[test]
    fn test_empty_outputs() {
        assert_eq!(parse_outputs("{}\n").unwrap(), StackOutputs::default());
    }

    #[test]
    fn test_copy_dir_skips_cache() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("main.tf"), "").unwrap();
        std::fs::create_dir_all(source.path().join("modules/vpc")).unwrap();
        std::fs::write(source.path().join("modules/vpc/main.tf"), "").unwrap();
        std::fs::create_dir_all(source.path().join(".terraform/providers")).unwrap();

        let dest = target.path().join("stack");
        copy_dir(source.path(), &dest).unwrap();
        assert!(dest.join("main.tf").exists());
        assert!(dest.join("modules/vpc/main.tf").exists());
        assert!(!dest.join(".terraform").exists());
    }

    #[test]
    fn test_parse_tool_version() {
        let raw = r#"{"terraform_version":"1.7.5","platform":"linux_amd64","provider_selections":{}}"#;
        assert_eq!(parse_tool_version(raw).unwrap(), "1.7.5");
        assert!(matches!(
            parse_tool_version("Terraform v1.7.5"),
            Err(DriverError::OutputParse(_))
        ));
        assert!(parse_tool_version("{}").is_err());
    }

    fn network_entity() -> Entity {
        use infraflow_core::{CloudType, NetworkSpec, ResourceSpec, Spec};
        Entity::new(
            "net",
            Some("acct".to_string()),
            Spec {
                cloud: CloudType::Aws,
                infra_version: "v2.3.0".to_string(),
                resource: ResourceSpec::Network(NetworkSpec {
                    region: "us-west-2".to_string(),
                    cidr: "10.0.0.0/16".to_string(),
                    availability_zones: vec![],
                    public_subnets: vec![],
                    private_subnets: vec![],
                }),
            },
        )
    }

    fn unpinned_bundle(config_dir: &Path, tool_binary: PathBuf) -> ResolvedBundle {
        ResolvedBundle {
            cloud: infraflow_core::CloudType::Aws,
            version: "v2.3.0".to_string(),
            kind: infraflow_core::EntityKind::Network,
            config_dir: config_dir.to_path_buf(),
            addons_dir: config_dir.join("addons"),
            tool_binary,
            tool_version: "1.7.5".to_string(),
            verify_tool: true,
        }
    }

    async fn prepare(work: &Path, bundle: ResolvedBundle) -> Result<Driver> {
        let settings = DriverSettings {
            work_dir: work.to_path_buf(),
            tail_lines: 20,
        };
        Driver::prepare(
            &settings,
            bundle,
            &network_entity(),
            StackArgs::default(),
            Utc::now() + chrono::Duration::minutes(5),
        )
        .await
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, reported: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(format!("terraform-{}", reported));
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  version) echo '{{\"terraform_version\":\"{}\"}}' ;;\n  init) echo initialized ;;\nesac\n",
            reported
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unpinned_tool_must_match_bundle_version() {
        let bundle_dir = tempfile::tempdir().unwrap();
        std::fs::write(bundle_dir.path().join("main.tf"), "").unwrap();
        let tools = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();

        let tool = fake_tool(tools.path(), "1.7.5");
        let mut driver = prepare(work.path(), unpinned_bundle(bundle_dir.path(), tool))
            .await
            .unwrap();
        driver.init().await.unwrap();
        assert_eq!(driver.state(), StackState::Initialized);
        driver.close(false).await.unwrap();

        let tool = fake_tool(tools.path(), "1.8.0");
        let mut driver = prepare(work.path(), unpinned_bundle(bundle_dir.path(), tool))
            .await
            .unwrap();
        let err = driver.init().await.unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedVersion { .. }));
        assert!(err.to_string().contains("1.8.0"));
        assert_eq!(driver.state(), StackState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_copy_leaves_no_work_dir() {
        let bundle_dir = tempfile::tempdir().unwrap();
        std::fs::write(bundle_dir.path().join("main.tf"), "").unwrap();
        std::os::unix::fs::symlink(
            bundle_dir.path().join("gone.tf"),
            bundle_dir.path().join("variables.tf"),
        )
        .unwrap();
        let work = tempfile::tempdir().unwrap();

        let bundle = unpinned_bundle(bundle_dir.path(), PathBuf::from("terraform"));
        let prepared = prepare(work.path(), bundle).await;
        assert!(matches!(prepared, Err(DriverError::Io(_))));

        let leftovers = std::fs::read_dir(work.path().join("net")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
