//! Command executors.
//!
//! Every backend implements [`CommandExecutor`], which owns the lifecycle of
//! exactly one [`Command`]:
//!
//! 1. [`CommandExecutor::start`] prepares the job directory and launches the
//!    job (spawn for local, submission tool for schedulers)
//! 2. [`CommandExecutor::status`] evaluates the job directory without blocking
//! 3. [`CommandExecutor::wait_for`] polls until an exit code is available
//! 4. [`CommandExecutor::stop`] cancels through the backend's own tool
//!
//! # Backends
//!
//! - [`LocalExecutor`]: spawns `/bin/sh <wrapper>` directly
//! - [`SgeExecutor`]: `qsub` / `qdel`
//! - [`SlurmExecutor`]: `sbatch` / `scancel`
//!
//! Batch backends share [`batch::BatchExecutor`] and differ only in their
//! [`batch::BatchBackend`] implementation.

pub mod batch;
pub mod local;
pub mod poll;
pub mod runner;
pub mod sge;
pub mod slurm;
pub mod submission;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStatus};
use crate::config::{BackendConfig, ExecutorSettings};
use crate::error::{ExecError, Result};
use crate::jobdir::JobDir;
use crate::recovery::JobSnapshot;

pub use local::LocalExecutor;
pub use poll::EXIT_INDETERMINATE;
#[cfg(any(test, feature = "test-util"))]
pub use runner::MockRunner;
pub use runner::{CommandRunner, RunOutput, ShellRunner, ToolInvocation};
pub use sge::{Sge, SgeExecutor};
pub use slurm::{Slurm, SlurmExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    Sge,
    Slurm,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Local => write!(f, "local"),
            BackendType::Sge => write!(f, "sge"),
            BackendType::Slurm => write!(f, "slurm"),
        }
    }
}

impl FromStr for BackendType {
    type Err = ExecError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendType::Local),
            "sge" => Ok(BackendType::Sge),
            "slurm" => Ok(BackendType::Slurm),
            other => Err(ExecError::UnknownBackend(other.to_string())),
        }
    }
}

/// Capability set of an execution backend.
///
/// Callers create one executor per command. `status` may be called from any
/// thread at any time, including while another task is inside `wait_for`.
#[async_trait]
pub trait CommandExecutor: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> BackendType;

    fn command(&self) -> &Command;

    fn job_dir(&self) -> &JobDir;

    /// Backend-assigned job id, once submission has succeeded.
    fn job_id(&self) -> Option<String>;

    /// Launch the command. Configuration errors are reported before any
    /// file is written or external tool is run. A second call fails.
    async fn start(&self, config: &BackendConfig) -> Result<()>;

    /// Current lifecycle status; also advances `command().status()`.
    fn status(&self) -> CommandStatus;

    /// Exit code of the command, or [`EXIT_INDETERMINATE`] if it was stopped
    /// or the code never became readable.
    async fn wait_for(&self) -> i32;

    /// Set the stopped flag, then cancel through the backend's tool. An
    /// error does not mean the job is still alive; re-check `status`.
    async fn stop(&self) -> Result<()>;

    /// Backend bookkeeping files that are never stage outputs.
    fn ignorable_outputs(&self) -> Vec<String>;

    /// Human-readable status line for diagnostics.
    fn status_message(&self) -> String;

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::capture(self)
    }
}

/// Build a fresh executor for `command` on `backend`.
pub fn create_executor(
    backend: BackendType,
    settings: ExecutorSettings,
    command: Command,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn CommandExecutor> {
    match backend {
        BackendType::Local => Arc::new(LocalExecutor::new(settings, command, runner)),
        BackendType::Sge => Arc::new(SgeExecutor::new(Sge, settings, command, runner)),
        BackendType::Slurm => Arc::new(SlurmExecutor::new(Slurm, settings, command, runner)),
    }
}

/// Outcome of a finished command, as handed back to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub command_id: String,
    pub status: CommandStatus,
    pub exit_code: i32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Gather the result after `wait_for` returned `exit_code`.
    pub async fn collect(executor: &dyn CommandExecutor, exit_code: i32) -> Self {
        let (output, error) = executor.job_dir().read_output().await;
        let status = executor.status();

        if exit_code == 0 {
            tracing::info!(command_id = %executor.command().id, "Command succeeded");
        } else {
            tracing::warn!(
                command_id = %executor.command().id,
                exit_code,
                %status,
                "Command failed"
            );
        }

        Self {
            command_id: executor.command().id.clone(),
            status,
            exit_code,
            output,
            error,
            completed_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
