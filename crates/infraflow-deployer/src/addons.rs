//! Post-provisioning add-on installation for fresh clusters

use crate::error::{DeployError, Result, Stage};
use async_trait::async_trait;
use infraflow_core::{ClusterOutputs, ErrorKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::Instant;

/// What an installer gets to work with
#[derive(Debug, Clone)]
pub struct AddonRequest<'a> {
    pub cluster: &'a ClusterOutputs,
    /// Short-lived bearer token from the just-applied outputs
    pub token: Option<&'a str>,
    /// Add-on names, in installation order
    pub addons: Vec<&'static str>,
    /// `<bundle>/addons`, one `<name>.yaml` per add-on
    pub manifests_dir: &'a Path,
    /// Stack working directory; installers may write scratch files here
    pub work_dir: &'a Path,
    pub deadline: Instant,
}

#[async_trait]
pub trait AddonInstaller: Send + Sync {
    /// Install every requested add-on, returning the installed names
    async fn install(&self, request: AddonRequest<'_>) -> Result<Vec<String>>;
}

/// Applies add-on manifests with `kubectl`
#[derive(Debug, Clone)]
pub struct KubectlAddonInstaller {
    kubectl: String,
}

impl KubectlAddonInstaller {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    async fn apply_manifest(
        &self,
        kubeconfig: &Path,
        manifest: &Path,
        deadline: Instant,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("--kubeconfig")
            .arg(kubeconfig)
            .arg("apply")
            .arg("-f")
            .arg(manifest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Running: {} apply -f {}", self.kubectl, manifest.display());

        let output = match tokio::time::timeout_at(deadline, cmd.output()).await {
            Ok(output) => output.map_err(|e| {
                DeployError::new(
                    Stage::Addons,
                    ErrorKind::ExecutionError,
                    format!("failed to run {}: {}", self.kubectl, e),
                )
            })?,
            Err(_) => {
                return Err(DeployError::new(
                    Stage::Addons,
                    ErrorKind::Timeout,
                    format!("kubectl apply -f {} did not finish", manifest.display()),
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::new(
                Stage::Addons,
                ErrorKind::ExecutionError,
                format!(
                    "kubectl apply -f {} failed: {}",
                    manifest.display(),
                    stderr.trim()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AddonInstaller for KubectlAddonInstaller {
    async fn install(&self, request: AddonRequest<'_>) -> Result<Vec<String>> {
        if request.addons.is_empty() {
            return Ok(Vec::new());
        }
        let token = request.token.filter(|t| !t.is_empty()).ok_or_else(|| {
            DeployError::new(
                Stage::Addons,
                ErrorKind::CredentialError,
                "stack outputs carry no cluster_token",
            )
        })?;

        let kubeconfig = write_kubeconfig(request.work_dir, request.cluster, token).await?;

        let mut installed = Vec::new();
        for name in &request.addons {
            let manifest = request.manifests_dir.join(format!("{}.yaml", name));
            if !manifest.is_file() {
                return Err(DeployError::new(
                    Stage::Addons,
                    ErrorKind::ExecutionError,
                    format!("bundle has no manifest for add-on {}", name),
                ));
            }
            self.apply_manifest(&kubeconfig, &manifest, request.deadline)
                .await?;
            tracing::info!("{}: installed add-on {}", request.cluster.cluster_name, name);
            installed.push(name.to_string());
        }
        Ok(installed)
    }
}

#[derive(Serialize)]
struct Kubeconfig<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<'a, ClusterEntry<'a>>>,
    users: Vec<Named<'a, UserEntry<'a>>>,
    contexts: Vec<Named<'a, ContextEntry<'a>>>,
    #[serde(rename = "current-context")]
    current_context: &'a str,
}

#[derive(Serialize)]
struct Named<'a, T> {
    name: &'a str,
    #[serde(flatten)]
    entry: T,
}

#[derive(Serialize)]
struct ClusterEntry<'a> {
    cluster: ClusterFields<'a>,
}

#[derive(Serialize)]
struct ClusterFields<'a> {
    server: &'a str,
    #[serde(
        rename = "certificate-authority-data",
        skip_serializing_if = "Option::is_none"
    )]
    certificate_authority_data: Option<&'a str>,
}

#[derive(Serialize)]
struct UserEntry<'a> {
    user: UserFields<'a>,
}

#[derive(Serialize)]
struct UserFields<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct ContextEntry<'a> {
    context: ContextFields<'a>,
}

#[derive(Serialize)]
struct ContextFields<'a> {
    cluster: &'a str,
    user: &'a str,
}

fn render_kubeconfig(cluster: &ClusterOutputs, token: &str) -> Result<String> {
    let name = cluster.cluster_name.as_str();
    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name,
            entry: ClusterEntry {
                cluster: ClusterFields {
                    server: &cluster.endpoint,
                    certificate_authority_data: cluster.ca_certificate.as_deref(),
                },
            },
        }],
        users: vec![Named {
            name,
            entry: UserEntry {
                user: UserFields { token },
            },
        }],
        contexts: vec![Named {
            name,
            entry: ContextEntry {
                context: ContextFields {
                    cluster: name,
                    user: name,
                },
            },
        }],
        current_context: name,
    };
    serde_yaml::to_string(&config).map_err(|e| {
        DeployError::new(Stage::Addons, ErrorKind::Internal, format!("kubeconfig: {}", e))
    })
}

async fn write_kubeconfig(work_dir: &Path, cluster: &ClusterOutputs, token: &str) -> Result<PathBuf> {
    let io_error = |e: std::io::Error| {
        DeployError::new(Stage::Addons, ErrorKind::Internal, format!("kubeconfig: {}", e))
    };
    let path = work_dir.join("kubeconfig.yaml");
    tokio::fs::write(&path, render_kubeconfig(cluster, token)?)
        .await
        .map_err(io_error)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_error)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cluster() -> ClusterOutputs {
        ClusterOutputs {
            cluster_name: "prod".to_string(),
            endpoint: "https://10.0.0.1:6443".to_string(),
            ca_certificate: Some("LS0tLS1CRUdJTg==".to_string()),
            addons: vec![],
        }
    }

    #[test]
    fn test_kubeconfig_shape() {
        let yaml = render_kubeconfig(&cluster(), "tok").unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed["apiVersion"], "v1");
        assert_eq!(parsed["current-context"], "prod");
        assert_eq!(parsed["clusters"][0]["name"], "prod");
        assert_eq!(parsed["clusters"][0]["cluster"]["server"], "https://10.0.0.1:6443");
        assert_eq!(
            parsed["clusters"][0]["cluster"]["certificate-authority-data"],
            "LS0tLS1CRUdJTg=="
        );
        assert_eq!(parsed["users"][0]["user"]["token"], "tok");
        assert_eq!(parsed["contexts"][0]["context"]["cluster"], "prod");
    }

    #[tokio::test]
    async fn test_missing_token_is_a_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster();
        let err = KubectlAddonInstaller::new("kubectl")
            .install(AddonRequest {
                cluster: &cluster,
                token: None,
                addons: vec!["ingress"],
                manifests_dir: dir.path(),
                work_dir: dir.path(),
                deadline: Instant::now() + Duration::from_secs(5),
            })
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Addons);
        assert_eq!(err.kind, ErrorKind::CredentialError);
    }

    #[tokio::test]
    async fn test_nothing_to_install() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster();
        let installed = KubectlAddonInstaller::new("/nonexistent/kubectl")
            .install(AddonRequest {
                cluster: &cluster,
                token: None,
                addons: vec![],
                manifests_dir: dir.path(),
                work_dir: dir.path(),
                deadline: Instant::now() + Duration::from_secs(5),
            })
            .await
            .unwrap();
        assert!(installed.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_applies_each_manifest_in_order() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join("addons");
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(manifests.join("storage-classes.yaml"), "kind: StorageClass").unwrap();
        std::fs::write(manifests.join("ingress.yaml"), "kind: Deployment").unwrap();

        let log = dir.path().join("kubectl.log");
        let kubectl = dir.path().join("kubectl");
        std::fs::write(
            &kubectl,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&kubectl, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cluster = cluster();
        let installed = KubectlAddonInstaller::new(kubectl.to_string_lossy())
            .install(AddonRequest {
                cluster: &cluster,
                token: Some("tok"),
                addons: vec!["storage-classes", "ingress"],
                manifests_dir: &manifests,
                work_dir: dir.path(),
                deadline: Instant::now() + Duration::from_secs(10),
            })
            .await
            .unwrap();

        assert_eq!(installed, vec!["storage-classes", "ingress"]);
        let calls = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("storage-classes.yaml"));
        assert!(lines[1].ends_with("ingress.yaml"));
        assert!(dir.path().join("kubeconfig.yaml").exists());
    }
}
