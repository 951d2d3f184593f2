//! Task workers
//!
//! A worker leases tasks, turns each into a [`TaskInfo`] and hands it to a
//! [`TaskRunner`] on its own tokio task. The lease is kept alive with
//! heartbeats for as long as the runner is busy.

use crate::error::Result;
use crate::lineage;
use crate::tasks::TaskManager;
use chrono::Utc;
use infraflow_config::WorkerConfig;
use infraflow_core::{EntityStore, ErrorDetail, Task, TaskInfo, TaskResult};
use infraflow_deployer::TaskRunner;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone)]
pub struct Worker {
    id: String,
    tasks: Arc<TaskManager>,
    store: Arc<dyn EntityStore>,
    runner: Arc<dyn TaskRunner>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        tasks: Arc<TaskManager>,
        store: Arc<dyn EntityStore>,
        runner: Arc<dyn TaskRunner>,
        config: WorkerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.batch.max(1)));
        Self {
            id: id.into(),
            tasks,
            store,
            runner,
            config,
            slots,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll until `shutdown` flips to `true`, then wait for running tasks
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Worker {} started", self.id);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let capacity = self.config.batch.max(1) as u32;
        if self.slots.acquire_many(capacity).await.is_ok() {
            tracing::info!("Worker {} stopped", self.id);
        }
    }

    async fn poll(&self) {
        let free = self.slots.available_permits();
        if free == 0 {
            return;
        }
        let leased = match self.tasks.lease(&self.id, free, Utc::now()).await {
            Ok(leased) => leased,
            Err(e) => {
                tracing::warn!("Worker {}: lease failed: {}", self.id, e);
                return;
            }
        };

        for task in leased {
            let Ok(permit) = self.slots.clone().acquire_owned().await else {
                return;
            };
            let worker = self.clone();
            tokio::spawn(async move {
                let task_id = task.id;
                if let Err(e) = worker.execute(task).await {
                    tracing::warn!("Worker {}: task {}: {}", worker.id, task_id, e);
                }
                drop(permit);
            });
        }
    }

    /// Lease and run up to one batch inline; returns the finished tasks
    pub async fn process_once(&self) -> Result<Vec<Task>> {
        let leased = self
            .tasks
            .lease(&self.id, self.config.batch.max(1), Utc::now())
            .await?;
        let mut done = Vec::with_capacity(leased.len());
        for task in leased {
            done.push(self.execute(task).await?);
        }
        Ok(done)
    }

    async fn execute(&self, task: Task) -> Result<Task> {
        let task = self.tasks.acknowledge(task.id, &self.id, Utc::now()).await?;

        let result = match self.task_info(&task).await {
            Ok(info) => self.run_with_heartbeat(info).await,
            Err(e) => {
                tracing::warn!("Task {}: cannot build request: {}", task.id, e);
                TaskResult::failed(ErrorDetail::new(e.kind(), e.to_string()).at_stage("dispatch"))
            }
        };

        self.tasks.complete(task.id, &self.id, result, Utc::now()).await
    }

    async fn task_info(&self, task: &Task) -> Result<TaskInfo> {
        let entity = self.store.require(&task.entity_id).await?;
        let ancestors = lineage::ancestors(self.store.as_ref(), &entity).await?;
        let access = lineage::root_access(&entity, &ancestors)?;
        Ok(TaskInfo {
            task_id: task.id,
            operation: task.operation,
            attempt: task.attempt,
            deadline: task.deadline,
            entity,
            ancestors,
            access,
        })
    }

    async fn run_with_heartbeat(&self, info: TaskInfo) -> TaskResult {
        let task_id = info.task_id;
        let run = self.runner.run_task(info);
        tokio::pin!(run);

        let mut beat = tokio::time::interval(self.config.heartbeat);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = beat.tick() => {
                    if let Err(e) = self.tasks.heartbeat(task_id, &self.id, Utc::now()).await {
                        tracing::warn!("Worker {}: heartbeat for {} failed: {}", self.id, task_id, e);
                    }
                }
            }
        }
    }
}

/// `worker.count` workers sharing one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        tasks: Arc<TaskManager>,
        store: Arc<dyn EntityStore>,
        runner: Arc<dyn TaskRunner>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..config.count)
            .map(|i| {
                let worker = Worker::new(
                    format!("worker-{}", i),
                    tasks.clone(),
                    store.clone(),
                    runner.clone(),
                    config.clone(),
                );
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to drain after shutdown
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, account, activate, network, storage};
    use infraflow_config::TaskConfig;
    use infraflow_core::{ErrorKind, MemoryEntityStore, Operation, Phase, TaskState};

    async fn setup(runner: Arc<ScriptedRunner>) -> (Arc<MemoryEntityStore>, Arc<TaskManager>, Worker) {
        let store = Arc::new(MemoryEntityStore::new());
        store.insert(activate(account("acct"))).await.unwrap();
        let tasks = Arc::new(TaskManager::new(store.clone(), TaskConfig::default()));
        let worker = Worker::new(
            "w1",
            tasks.clone(),
            store.clone(),
            runner,
            WorkerConfig::default(),
        );
        (store, tasks, worker)
    }

    #[tokio::test]
    async fn test_task_info_carries_ancestors_and_root_access() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (store, tasks, worker) = setup(runner.clone()).await;
        store.insert(activate(network("net", "acct"))).await.unwrap();
        store.insert(storage("bucket", "net")).await.unwrap();

        let entity = store.require("bucket").await.unwrap();
        tasks
            .enqueue(&entity, Operation::CreateOrUpdate, Utc::now())
            .await
            .unwrap();
        let done = worker.process_once().await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, TaskState::Succeeded);

        let seen = runner.seen();
        let ids: Vec<&str> = seen[0].ancestors.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["net", "acct"]);
        assert_eq!(seen[0].parent().and_then(|p| p.status.vpc_id()), Some("vpc-123"));
        assert!(matches!(seen[0].access, infraflow_core::AccessSpec::Aws { .. }));
        assert_eq!(store.require("bucket").await.unwrap().status.phase, Phase::Active);
    }

    #[tokio::test]
    async fn test_deployer_sees_deadline_from_start() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (store, tasks, worker) = setup(runner.clone()).await;
        store.insert(network("net", "acct")).await.unwrap();

        // Queued long enough ago that a queue-time deadline would have passed
        let entity = store.require("net").await.unwrap();
        let queued_at = Utc::now() - chrono::Duration::hours(2);
        tasks
            .enqueue(&entity, Operation::CreateOrUpdate, queued_at)
            .await
            .unwrap();
        let before = Utc::now();
        worker.process_once().await.unwrap();

        let seen = runner.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].deadline > before);
    }

    #[tokio::test]
    async fn test_broken_lineage_fails_the_task() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (store, tasks, worker) = setup(runner.clone()).await;
        store.insert(network("net", "missing")).await.unwrap();

        let entity = store.require("net").await.unwrap();
        tasks
            .enqueue(&entity, Operation::CreateOrUpdate, Utc::now())
            .await
            .unwrap();
        let done = worker.process_once().await.unwrap();

        let error = done[0].result.as_ref().and_then(|r| r.error.clone()).unwrap();
        assert_eq!(error.kind, ErrorKind::ParentNotReady);
        assert_eq!(error.stage.as_deref(), Some("dispatch"));
        assert!(runner.seen().is_empty());
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (store, tasks, _) = setup(runner.clone()).await;
        for i in 0..4 {
            let net = network(&format!("net-{}", i), "acct");
            store.insert(net.clone()).await.unwrap();
            tasks
                .enqueue(&net, Operation::CreateOrUpdate, Utc::now())
                .await
                .unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let config = WorkerConfig {
            count: 2,
            poll_interval: std::time::Duration::from_millis(10),
            batch: 2,
            heartbeat: std::time::Duration::from_secs(1),
        };
        let pool = WorkerPool::spawn(tasks.clone(), store.clone(), runner.clone(), config, rx);
        assert_eq!(pool.len(), 2);

        for _ in 0..200 {
            let all_done = tasks.list().await.iter().all(|t| t.is_terminal());
            if all_done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        pool.join().await;

        assert_eq!(runner.seen().len(), 4);
        for i in 0..4 {
            let entity = store.require(&format!("net-{}", i)).await.unwrap();
            assert_eq!(entity.status.phase, Phase::Active);
        }
    }
}
