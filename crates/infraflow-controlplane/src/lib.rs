//! InfraFlow control plane
//!
//! The [`Controller`] compares desired and observed state and enqueues tasks
//! on the [`TaskManager`]; [`Worker`]s lease those tasks and hand them to a
//! [`TaskRunner`](infraflow_deployer::TaskRunner), either the in-process
//! deployer router or a remote deployer reached through [`HttpTaskRunner`].
//! Users talk to the [`EntityService`].

pub mod controller;
pub mod error;
pub mod http;
pub mod lineage;
pub mod service;
pub mod tasks;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use controller::{Controller, ReconcileReport, SkipReason};
pub use error::{ControlError, Result};
pub use http::{HttpTaskRunner, RUN_TASK_PATH};
pub use service::{EntityService, ManifestReport};
pub use tasks::TaskManager;
pub use worker::{Worker, WorkerPool};

/// Config durations as chrono spans, capped at one year
pub(crate) fn span(duration: std::time::Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(365);
    chrono::Duration::from_std(duration).map_or(cap, |d| d.min(cap))
}
