//! InfraFlow cloud providers
//!
//! Translates entities into IaC tool arguments, one provider per cloud:
//!
//! - `var_args`: spec fields (and parent outputs) as ordered `key=value` pairs
//! - `credential_var_args`: short-lived credentials, resolved on every call
//! - `backend_args`: remote state location, unique per entity
//! - `verify_identity`: account check used by the account deployer

pub mod aws;
pub mod azure;
pub mod error;
pub mod gcp;
pub mod provider;
pub mod sts;

pub use error::{CloudError, Result};
pub use provider::{ProviderTable, StackInput, VarArg, VariableProvider};
pub use sts::{AwsCli, AwsCredentials, CallerIdentity};
