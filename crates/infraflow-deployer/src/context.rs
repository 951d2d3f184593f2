//! Shared collaborators of every deployer

use crate::addons::{AddonInstaller, KubectlAddonInstaller};
use infraflow_cloud::ProviderTable;
use infraflow_config::DaemonConfig;
use infraflow_driver::{BundleCatalog, DriverSettings};
use std::sync::Arc;

#[derive(Clone)]
pub struct DeployContext {
    pub catalog: Arc<BundleCatalog>,
    pub providers: Arc<ProviderTable>,
    pub driver: DriverSettings,
    /// Keep working directories of failed executions
    pub retain_failed: bool,
    pub addons: Arc<dyn AddonInstaller>,
}

impl DeployContext {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            catalog: Arc::new(BundleCatalog::from_config(&config.bundles)),
            providers: Arc::new(ProviderTable::from_config(config)),
            driver: DriverSettings::from(&config.execution),
            retain_failed: config.execution.retain_failed,
            addons: Arc::new(KubectlAddonInstaller::new(&config.execution.kubectl)),
        }
    }

    pub fn with_addon_installer(mut self, installer: Arc<dyn AddonInstaller>) -> Self {
        self.addons = installer;
        self
    }
}
