//! The staged pipeline shared by the IaC-backed deployers
//!
//! Resolve → Credentials → Arguments → Prepare → Apply|Destroy → Output.
//! A failing stage aborts the rest. Nothing is rolled back: the remote
//! state stays where the backend arguments put it, so a retry resumes.

use crate::context::DeployContext;
use crate::error::{DeployError, Result, Stage};
use infraflow_cloud::StackInput;
use infraflow_core::{EntityKind, ErrorKind, TaskInfo};
use infraflow_driver::{Driver, ResolvedBundle, StackArgs, StackOutputs};
use std::path::Path;

pub(crate) struct Stack<'a> {
    ctx: &'a DeployContext,
    driver: Driver,
}

impl<'a> Stack<'a> {
    pub async fn open(ctx: &'a DeployContext, info: &TaskInfo, kind: EntityKind) -> Result<Self> {
        let entity = &info.entity;
        if entity.kind() != kind {
            return Err(DeployError::new(
                Stage::Resolve,
                ErrorKind::InvalidSpec,
                format!("{} is a {}, not a {}", entity.id, entity.kind(), kind),
            ));
        }

        let bundle = ctx
            .catalog
            .resolve(entity.spec.cloud, &entity.spec.infra_version, kind)
            .map_err(|e| DeployError::driver(Stage::Resolve, e))?;

        let provider = ctx.providers.get(entity.spec.cloud);
        let credentials = provider
            .credential_var_args(&info.access, &entity.id)
            .await
            .map_err(|e| DeployError::cloud(Stage::Credentials, e))?;

        let input = StackInput::new(entity, &info.ancestors);
        let vars = provider
            .var_args(&input)
            .map_err(|e| DeployError::cloud(Stage::Arguments, e))?;
        let backend = provider
            .backend_args(entity)
            .map_err(|e| DeployError::cloud(Stage::Arguments, e))?;

        let args = StackArgs {
            vars,
            backend,
            credentials,
        };
        let driver = Driver::prepare(&ctx.driver, bundle, entity, args, info.deadline)
            .await
            .map_err(|e| DeployError::driver(Stage::Prepare, e))?;

        Ok(Self { ctx, driver })
    }

    pub fn bundle(&self) -> &ResolvedBundle {
        self.driver.bundle()
    }

    pub fn work_dir(&self) -> &Path {
        self.driver.work_dir()
    }

    pub async fn apply(&mut self) -> Result<StackOutputs> {
        self.driver
            .apply()
            .await
            .map_err(|e| DeployError::driver(Stage::Apply, e))?;
        self.driver
            .output()
            .await
            .map_err(|e| DeployError::driver(Stage::Output, e))
    }

    pub async fn destroy(&mut self) -> Result<()> {
        self.driver
            .destroy()
            .await
            .map_err(|e| DeployError::driver(Stage::Destroy, e))
    }

    /// Release the working directory; a cleanup failure is only logged
    pub async fn close(self, success: bool) {
        let retain = !success && self.ctx.retain_failed;
        if let Err(e) = self.driver.close(retain).await {
            tracing::warn!("Failed to remove working directory: {}", e);
        }
    }
}

/// Required string output
pub(crate) fn required_output<'o>(outputs: &'o StackOutputs, name: &str) -> Result<&'o str> {
    outputs.string(name).ok_or_else(|| {
        DeployError::new(
            Stage::Parse,
            ErrorKind::OutputParseError,
            format!("missing string output {}", name),
        )
    })
}
