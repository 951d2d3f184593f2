//! Typed daemon configuration with built-in defaults

use infraflow_core::CloudType;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Complete daemon configuration, resolved once at startup
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub controller: ControllerConfig,
    pub tasks: TaskConfig,
    pub worker: WorkerConfig,
    pub store: StoreConfig,
    pub bundles: BundleConfig,
    pub execution: ExecutionConfig,
    pub backends: BTreeMap<CloudType, BackendSettings>,
    pub credentials: CredentialConfig,
    pub server: ServerConfig,
    pub deployer: DeployerConfig,
}

impl DaemonConfig {
    /// State backend settings for a cloud (empty settings when not configured)
    pub fn backend(&self, cloud: CloudType) -> BackendSettings {
        self.backends.get(&cloud).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Reconciliation tick
    pub interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Failed attempts after which an entity is frozen
    pub max_attempts: u32,
    /// Re-apply `Active` entities this long after their last transition
    pub resync: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(30 * 60),
            max_attempts: 5,
            resync: None,
        }
    }
}

impl ControllerConfig {
    /// Delay before retrying after `attempts` consecutive failures
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap)
    }
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub lease_timeout: Duration,
    /// Wall-clock budget of a single task
    pub deadline: Duration,
    /// How long terminal tasks stay in history
    pub retention: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(10 * 60),
            deadline: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    pub poll_interval: Duration,
    /// Tasks leased per poll
    pub batch: usize,
    pub heartbeat: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            poll_interval: Duration::from_secs(5),
            batch: 1,
            heartbeat: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory holding `entities.json` and `tasks.json`
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("infraflow"))
        .unwrap_or_else(|| PathBuf::from(".infraflow"))
}

/// A `(cloud, version)` pair with its pinned tool version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub cloud: CloudType,
    pub version: String,
    pub tool_version: String,
}

#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// Root of `<cloud>/<version>/<kind>` bundle directories
    pub root: PathBuf,
    /// Tool executable name (terraform, tofu)
    pub tool: String,
    /// Directory with `<tool>-<tool_version>` binaries; `None` uses `tool` from
    /// PATH and checks its reported version before the first `init`
    pub tools_dir: Option<PathBuf>,
    pub entries: Vec<BundleEntry>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("bundles"),
            tool: "terraform".to_string(),
            tools_dir: None,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Parent of the per-execution working directories
    pub work_dir: PathBuf,
    /// Keep working directories of failed executions for debugging
    pub retain_failed: bool,
    /// Output lines embedded in execution errors
    pub tail_lines: usize,
    pub kubectl: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            work_dir: default_data_dir().join("stacks"),
            retain_failed: true,
            tail_lines: 40,
            kubectl: "kubectl".to_string(),
        }
    }
}

/// Remote state backend settings for one cloud
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    /// S3 / GCS bucket
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// DynamoDB lock table (AWS)
    pub lock_table: Option<String>,
    pub resource_group: Option<String>,
    pub storage_account: Option<String>,
    pub container: Option<String>,
    /// Prefix of every state key
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// AWS CLI used for STS calls
    pub aws_cli: String,
    pub session_duration: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            aws_cli: "aws".to_string(),
            session_duration: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7420".to_string(),
        }
    }
}

/// Where workers send tasks
#[derive(Debug, Clone, Default)]
pub struct DeployerConfig {
    /// Remote deployer base URL; `None` runs deployers in-process
    pub endpoint: Option<String>,
}
