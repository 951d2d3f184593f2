//! AWS CLI wrapper for STS calls
//!
//! Credential material is handed to the child process through its
//! environment and never appears on a command line or in a log line.

use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use infraflow_core::Secret;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Key pair (optionally with a session token) used to call AWS
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub session_token: Option<Secret>,
    pub expiration: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    pub fn from_keys(access_key_id: impl Into<String>, secret_access_key: Secret) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key,
            session_token: None,
            expiration: None,
        }
    }

    fn env(&self) -> Vec<(&'static str, &str)> {
        let mut env = vec![
            ("AWS_ACCESS_KEY_ID", self.access_key_id.as_str()),
            ("AWS_SECRET_ACCESS_KEY", self.secret_access_key.expose()),
        ];
        if let Some(token) = &self.session_token {
            env.push(("AWS_SESSION_TOKEN", token.expose()));
        }
        env
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    pub user_id: String,
    pub account: String,
    pub arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleOutput {
    credentials: SessionCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

/// `aws` CLI wrapper
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    session_duration: Duration,
}

impl AwsCli {
    pub fn new(program: impl Into<String>, session_duration: Duration) -> Self {
        Self {
            program: program.into(),
            session_duration,
        }
    }

    /// Exchange base credentials for short-lived role session credentials
    pub async fn assume_role(
        &self,
        base: &AwsCredentials,
        region: &str,
        role_arn: &str,
        external_id: Option<&str>,
        session_name: &str,
    ) -> Result<AwsCredentials> {
        let duration = self.session_duration.as_secs().clamp(900, 43_200).to_string();
        let mut args = vec![
            "sts",
            "assume-role",
            "--role-arn",
            role_arn,
            "--role-session-name",
            session_name,
            "--duration-seconds",
            duration.as_str(),
            "--output",
            "json",
        ];
        if let Some(external_id) = external_id {
            args.push("--external-id");
            args.push(external_id);
        }

        let output = self.run_command(&args, base, region).await?;
        let parsed: AssumeRoleOutput = serde_json::from_str(&output)?;
        let session = parsed.credentials;

        tracing::debug!(
            "Assumed role {} (session {}, expires {:?})",
            role_arn,
            session_name,
            session.expiration
        );

        Ok(AwsCredentials {
            access_key_id: session.access_key_id,
            secret_access_key: Secret::new(session.secret_access_key),
            session_token: Some(Secret::new(session.session_token)),
            expiration: session.expiration,
        })
    }

    /// Identity the credentials resolve to
    pub async fn caller_identity(
        &self,
        credentials: &AwsCredentials,
        region: &str,
    ) -> Result<CallerIdentity> {
        let output = self
            .run_command(
                &["sts", "get-caller-identity", "--output", "json"],
                credentials,
                region,
            )
            .await?;
        let identity: CallerIdentity = serde_json::from_str(&output)?;
        Ok(identity)
    }

    async fn run_command(
        &self,
        args: &[&str],
        credentials: &AwsCredentials,
        region: &str,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd.env_remove("AWS_PROFILE");
        cmd.env("AWS_REGION", region);
        cmd.envs(credentials.env());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: {} {}", self.program, args.join(" "));

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CloudError::CliNotFound(self.program.clone())
            } else {
                CloudError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloudError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
