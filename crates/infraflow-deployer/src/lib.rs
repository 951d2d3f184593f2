//! InfraFlow deployer services
//!
//! One service per entity kind. The IaC-backed ones (network, cluster,
//! storage) share a staged pipeline:
//!
//! ```text
//! Resolve → Credentials → Arguments → Prepare → Apply|Destroy → Output → Parse → Addons
//! ```
//!
//! The first failing stage ends the deployment and is reported verbatim in
//! the task result. Workers reach the services through [`TaskRunner`].

pub mod account;
pub mod addons;
pub mod cluster;
pub mod context;
pub mod error;
pub mod network;
pub mod router;
pub mod service;
mod stack;
pub mod storage;

pub use account::AccountDeployer;
pub use addons::{AddonInstaller, AddonRequest, KubectlAddonInstaller};
pub use cluster::ClusterDeployer;
pub use context::DeployContext;
pub use error::{DeployError, Result, Stage};
pub use network::NetworkDeployer;
pub use router::{DeployerRouter, TaskRunner};
pub use service::{DeployerService, Deployment};
pub use storage::StorageDeployer;
