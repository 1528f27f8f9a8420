//! Generic executor for batch schedulers.
//!
//! A scheduler plugs in by implementing [`BatchBackend`]; everything else
//! (job directory, wrapper, polling, stop flag) lives in [`BatchExecutor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandStatus};
use crate::config::{BackendConfig, ExecutorSettings};
use crate::error::{ExecError, Result};
use crate::executor::poll::{self, evaluate, Observation};
use crate::executor::runner::{CommandRunner, ToolInvocation};
use crate::executor::submission::TemplateSubmitter;
use crate::executor::{BackendType, CommandExecutor};
use crate::jobdir::JobDir;
use crate::recovery::JobSnapshot;

/// Scheduler-specific pieces of a batch executor.
pub trait BatchBackend: Send + Sync + std::fmt::Debug + 'static {
    const TYPE: BackendType;

    /// Header lines placed at the top of the wrapper script.
    fn directives(&self) -> String {
        String::new()
    }

    /// File in the job directory that receives the scheduler's own output.
    fn log_file(&self) -> &'static str;

    /// Build the submission command line. `config` is already normalized.
    fn submit_command(
        &self,
        command: &Command,
        dir: &JobDir,
        config: &BackendConfig,
    ) -> Result<ToolInvocation>;

    fn parse_job_id(&self, stdout: &str) -> Result<String>;

    fn cancel_command(&self, job_id: &str) -> ToolInvocation;

    fn status_message(&self, job_id: Option<&str>, status: CommandStatus) -> String;
}

#[derive(Debug)]
pub struct BatchExecutor<B: BatchBackend> {
    backend: B,
    command: Command,
    settings: ExecutorSettings,
    dir: JobDir,
    runner: Arc<dyn CommandRunner>,
    job_id: OnceLock<String>,
    started: AtomicBool,
    stopped: CancellationToken,
}

impl<B: BatchBackend> BatchExecutor<B> {
    pub fn new(
        backend: B,
        settings: ExecutorSettings,
        command: Command,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let dir = JobDir::for_command(&settings, &command.id);
        Self {
            backend,
            command,
            settings,
            dir,
            runner,
            job_id: OnceLock::new(),
            started: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        }
    }

    /// Reattach to a job submitted by an earlier controller process.
    pub fn restore(
        backend: B,
        settings: ExecutorSettings,
        snapshot: &JobSnapshot,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let job_id = OnceLock::new();
        if let Some(id) = &snapshot.job_id {
            let _ = job_id.set(id.clone());
        }
        Self {
            backend,
            command: snapshot.to_command(),
            settings,
            dir: JobDir::from_path(snapshot.job_dir.clone()),
            runner,
            job_id,
            started: AtomicBool::new(true),
            stopped: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<B: BatchBackend> CommandExecutor for BatchExecutor<B> {
    fn backend(&self) -> BackendType {
        B::TYPE
    }

    fn command(&self) -> &Command {
        &self.command
    }

    fn job_dir(&self) -> &JobDir {
        &self.dir
    }

    fn job_id(&self) -> Option<String> {
        self.job_id.get().cloned()
    }

    async fn start(&self, config: &BackendConfig) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ExecError::Submission(format!(
                "command {} was already started",
                self.command.id
            )));
        }

        // Validation happens before any file is written or tool is run.
        let config = config.normalized()?;
        let invocation = self.backend.submit_command(&self.command, &self.dir, &config)?;

        let submitter = TemplateSubmitter::new(&self.dir, self.runner.as_ref());
        submitter
            .prepare(&self.settings, &self.command, &self.backend.directives())
            .await?;
        self.status();

        let job_id = submitter
            .submit(&invocation, |out| self.backend.parse_job_id(out))
            .await?;

        tracing::info!(
            command_id = %self.command.id,
            backend = %B::TYPE,
            job_id = %job_id,
            "Submitted job"
        );
        let _ = self.job_id.set(job_id);
        self.status();
        Ok(())
    }

    fn status(&self) -> CommandStatus {
        let obs = Observation::observe(&self.dir, self.job_id.get().is_some());
        self.command.advance(evaluate(&obs))
    }

    async fn wait_for(&self) -> i32 {
        let job_id_known = || self.job_id.get().is_some();
        poll::wait_for_exit(
            &self.command,
            &self.dir,
            &job_id_known,
            None,
            &self.settings.poll,
            &self.stopped,
        )
        .await
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.cancel();

        let Some(job_id) = self.job_id.get() else {
            tracing::info!(command_id = %self.command.id, "Stop requested before submission");
            return Ok(());
        };

        let invocation = self.backend.cancel_command(job_id);
        let output = self.runner.run(&invocation).await.map_err(|e| ExecError::Stop {
            job_id: job_id.clone(),
            stderr: e.to_string(),
        })?;

        if !output.success() {
            tracing::warn!(
                command_id = %self.command.id,
                job_id = %job_id,
                code = ?output.code,
                "Cancellation tool failed"
            );
            return Err(ExecError::Stop {
                job_id: job_id.clone(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        tracing::info!(command_id = %self.command.id, job_id = %job_id, "Cancelled job");
        Ok(())
    }

    fn ignorable_outputs(&self) -> Vec<String> {
        let mut outputs = self.dir.bookkeeping_files();
        outputs.push(self.dir.file(self.backend.log_file()).display().to_string());
        outputs
    }

    fn status_message(&self) -> String {
        self.backend
            .status_message(self.job_id.get().map(String::as_str), self.command.status())
    }
}

/// Job name accepted by scheduler tools: alphanumerics, `_`, `-` and `.`,
/// never starting with a digit.
pub fn job_name(command: &Command) -> String {
    let source = if command.name.trim().is_empty() {
        &command.id
    } else {
        &command.name
    };
    let mut name: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert_str(0, "job_");
    }
    name
}

/// Split the raw `request_options` value into arguments.
pub fn request_options(config: &BackendConfig) -> Vec<String> {
    config
        .get(crate::config::keys::REQUEST_OPTIONS)
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
