use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};

use crate::command::{Command, CommandStatus};
use crate::config::{BackendConfig, ExecutorSettings};
use crate::error::{ExecError, Result};
use crate::executor::{
    create_executor, BackendType, CommandExecutor, CommandRunner, ExecutionResult,
    EXIT_INDETERMINATE,
};
use crate::recovery::{restore, RecoveryStore};

struct TrackedJob {
    executor: Arc<dyn CommandExecutor>,
    result: watch::Receiver<Option<ExecutionResult>>,
    /// True once a stop through this tracker succeeded. Held for the whole
    /// stop, so the waiter sees the final outcome.
    cancelled: Arc<Mutex<bool>>,
}

/// One line of `JobTracker::list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub command_id: String,
    pub name: String,
    pub backend: BackendType,
    pub job_id: Option<String>,
    pub status: CommandStatus,
    pub message: String,
}

/// Keeps every in-flight executor of one controller.
///
/// Each tracked command gets its own waiter task running `wait_for`, so a
/// slow poll on one job never delays another. The recovery snapshot is
/// written right after a successful start and removed when the waiter
/// finishes with a known outcome. An indeterminate finish keeps it unless
/// the job completed or was cancelled successfully, so `recover` can still
/// reattach to a job that may be alive.
#[derive(Clone)]
pub struct JobTracker {
    settings: ExecutorSettings,
    runner: Arc<dyn CommandRunner>,
    store: RecoveryStore,
    jobs: Arc<RwLock<HashMap<String, TrackedJob>>>,
}

impl JobTracker {
    pub fn new(settings: ExecutorSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store: RecoveryStore::new(&settings),
            settings,
            runner,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &RecoveryStore {
        &self.store
    }

    /// Start `command` on `backend` and begin tracking it.
    pub async fn submit(
        &self,
        backend: BackendType,
        command: Command,
        config: &BackendConfig,
    ) -> Result<Arc<dyn CommandExecutor>> {
        if self.jobs.read().await.contains_key(&command.id) {
            return Err(ExecError::Submission(format!(
                "command {} is already in flight",
                command.id
            )));
        }

        let executor = create_executor(backend, self.settings.clone(), command, self.runner.clone());
        executor.start(config).await?;

        if let Err(e) = self.store.save(&executor.snapshot()).await {
            // An unrecorded job could never be recovered; cancel it.
            tracing::error!(command_id = %executor.command().id, error = %e, "Failed to persist snapshot");
            if let Err(stop_err) = executor.stop().await {
                tracing::warn!(
                    command_id = %executor.command().id,
                    error = %stop_err,
                    "Failed to cancel unrecorded job"
                );
            }
            return Err(e);
        }
        self.track(executor.clone()).await;
        Ok(executor)
    }

    /// Reattach every persisted command that is not already tracked.
    /// Returns the ids of the recovered commands.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for snapshot in self.store.load_all().await? {
            if self.jobs.read().await.contains_key(&snapshot.command_id) {
                continue;
            }
            let executor = restore(&snapshot, self.settings.clone(), self.runner.clone());
            let status = executor.status();
            tracing::info!(
                command_id = %snapshot.command_id,
                %status,
                "Recovered in-flight command"
            );
            recovered.push(snapshot.command_id.clone());
            self.track(executor).await;
        }
        Ok(recovered)
    }

    async fn track(&self, executor: Arc<dyn CommandExecutor>) {
        let (tx, rx) = watch::channel(None);
        let id = executor.command().id.clone();
        let cancelled = Arc::new(Mutex::new(false));
        self.jobs.write().await.insert(
            id.clone(),
            TrackedJob {
                executor: executor.clone(),
                result: rx,
                cancelled: cancelled.clone(),
            },
        );

        let store = self.store.clone();
        tokio::spawn(async move {
            let exit_code = executor.wait_for().await;
            let result = ExecutionResult::collect(executor.as_ref(), exit_code).await;
            let settled = exit_code != EXIT_INDETERMINATE
                || result.status == CommandStatus::Complete
                || *cancelled.lock().await;
            if settled {
                if let Err(e) = store.remove(&id).await {
                    tracing::warn!(command_id = %id, error = %e, "Failed to remove snapshot");
                }
            } else {
                tracing::warn!(
                    command_id = %id,
                    status = %result.status,
                    "Outcome indeterminate; keeping snapshot for recovery"
                );
            }
            let _ = tx.send(Some(result));
        });
    }

    pub async fn executor(&self, command_id: &str) -> Result<Arc<dyn CommandExecutor>> {
        self.jobs
            .read()
            .await
            .get(command_id)
            .map(|job| job.executor.clone())
            .ok_or_else(|| ExecError::CommandNotFound(command_id.to_string()))
    }

    pub async fn status(&self, command_id: &str) -> Result<CommandStatus> {
        Ok(self.executor(command_id).await?.status())
    }

    pub async fn stop(&self, command_id: &str) -> Result<()> {
        let (executor, cancelled) = self
            .jobs
            .read()
            .await
            .get(command_id)
            .map(|job| (job.executor.clone(), job.cancelled.clone()))
            .ok_or_else(|| ExecError::CommandNotFound(command_id.to_string()))?;
        let mut cancelled = cancelled.lock().await;
        executor.stop().await?;
        *cancelled = true;
        Ok(())
    }

    /// Stop everything that is still running. Returns the failures.
    pub async fn stop_all(&self) -> Vec<(String, ExecError)> {
        let ids: Vec<String> = self
            .jobs
            .read()
            .await
            .iter()
            .filter(|(_, job)| job.result.borrow().is_none())
            .map(|(id, _)| id.clone())
            .collect();

        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                failures.push((id, e));
            }
        }
        failures
    }

    /// Wait until the waiter task for `command_id` has produced a result.
    pub async fn wait(&self, command_id: &str) -> Result<ExecutionResult> {
        let mut rx = self
            .jobs
            .read()
            .await
            .get(command_id)
            .map(|job| job.result.clone())
            .ok_or_else(|| ExecError::CommandNotFound(command_id.to_string()))?;

        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return Ok(result);
            }
            if rx.changed().await.is_err() {
                return Err(ExecError::StatusIndeterminate(command_id.to_string()));
            }
        }
    }

    pub async fn wait_all(&self) -> Vec<Result<ExecutionResult>> {
        let ids: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.wait(&id).await);
        }
        results
    }

    /// Summaries of all tracked commands, sorted by id.
    pub async fn list(&self) -> Vec<JobSummary> {
        let jobs = self.jobs.read().await;
        let mut summaries: Vec<JobSummary> = jobs
            .values()
            .map(|job| {
                let exec = &job.executor;
                let status = exec.status();
                JobSummary {
                    command_id: exec.command().id.clone(),
                    name: exec.command().name.clone(),
                    backend: exec.backend(),
                    job_id: exec.job_id(),
                    status,
                    message: exec.status_message(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.command_id.cmp(&b.command_id));
        summaries
    }

    /// Bookkeeping files of every tracked command.
    pub async fn ignorable_outputs(&self) -> Vec<String> {
        self.jobs
            .read()
            .await
            .values()
            .flat_map(|job| job.executor.ignorable_outputs())
            .collect()
    }

    /// Drop finished commands. Returns how many were removed.
    pub async fn cleanup_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.result.borrow().is_none());
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
