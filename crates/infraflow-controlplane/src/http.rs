//! Task RPC client for deployers running as a separate `infraflowd deployer`

use crate::error::{ControlError, Result};
use async_trait::async_trait;
use chrono::Utc;
use infraflow_core::{ErrorDetail, ErrorKind, TaskInfo, TaskResult};
use infraflow_deployer::TaskRunner;
use std::time::Duration;

/// Path the deployer serves `RunTask` on
pub const RUN_TASK_PATH: &str = "/v1/tasks/run";

/// Allowance on top of the task deadline for the response to arrive
const RESPONSE_GRACE: Duration = Duration::from_secs(30);

pub struct HttpTaskRunner {
    client: reqwest::Client,
    url: String,
}

impl HttpTaskRunner {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ControlError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}{}", endpoint.trim_end_matches('/'), RUN_TASK_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, info: &TaskInfo) -> std::result::Result<TaskResult, reqwest::Error> {
        let budget = (info.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            + RESPONSE_GRACE;
        self.client
            .post(&self.url)
            .timeout(budget)
            .json(info)
            .send()
            .await?
            .error_for_status()?
            .json::<TaskResult>()
            .await
    }
}

#[async_trait]
impl TaskRunner for HttpTaskRunner {
    async fn run_task(&self, info: TaskInfo) -> TaskResult {
        match self.call(&info).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("RunTask {} to {} failed: {}", info.task_id, self.url, e);
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Unavailable
                };
                TaskResult::failed(ErrorDetail::new(kind, e.to_string()).at_stage("rpc"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, aws_access};
    use infraflow_core::Operation;
    use uuid::Uuid;

    #[test]
    fn test_url_joins_cleanly() {
        let runner = HttpTaskRunner::new("http://deployer:7421/").unwrap();
        assert_eq!(runner.url(), "http://deployer:7421/v1/tasks/run");
    }

    #[tokio::test]
    async fn test_unreachable_deployer_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let runner = HttpTaskRunner::new(&format!("http://{}", addr)).unwrap();
        let result = runner
            .run_task(TaskInfo {
                task_id: Uuid::new_v4(),
                operation: Operation::CreateOrUpdate,
                attempt: 1,
                deadline: Utc::now() + chrono::Duration::seconds(5),
                entity: account("acct"),
                ancestors: vec![],
                access: aws_access(),
            })
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Unavailable);
        assert_eq!(error.stage.as_deref(), Some("rpc"));
    }
}
