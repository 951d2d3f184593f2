//! InfraFlow execution driver
//!
//! Drives the infrastructure-as-code binary (terraform or a compatible tool)
//! against an exclusive working directory, and resolves which configuration
//! bundle and tool version an entity runs with.

pub mod catalog;
pub mod driver;
pub mod error;
mod process;

pub use catalog::{BundleCatalog, ResolvedBundle};
pub use driver::{
    Driver, DriverSettings, PlanSummary, StackArgs, StackOutputs, StackState, parse_outputs,
};
pub use error::{DriverError, Result};
