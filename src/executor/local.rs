//! Local process backend.
//!
//! Runs the same wrapper script as the batch backends, but spawns it
//! directly. The OS pid stands in for a scheduler job id. While this process
//! owns the child, `wait_for` joins it; after a restart the child handle is
//! gone and the executor polls the job directory, checking the pid so a
//! process that died without an exit file does not keep it waiting.
//!
//! Completion is only ever read from the exit file. A process that exits
//! without writing one, such as a killed wrapper, stays RUNNING and
//! `wait_for` reports [`EXIT_INDETERMINATE`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandStatus};
use crate::config::{BackendConfig, ExecutorSettings};
use crate::error::{ExecError, Result};
use crate::executor::poll::{self, evaluate, Exited, Liveness, Observation, EXIT_INDETERMINATE};
use crate::executor::runner::{CommandRunner, ToolInvocation};
use crate::executor::submission::TemplateSubmitter;
use crate::executor::{BackendType, CommandExecutor};
use crate::jobdir::{ExitFile, JobDir};
use crate::recovery::JobSnapshot;

#[derive(Debug)]
pub struct LocalExecutor {
    command: Command,
    settings: ExecutorSettings,
    dir: JobDir,
    runner: Arc<dyn CommandRunner>,
    pid: OnceLock<String>,
    child: Mutex<Option<Child>>,
    started: AtomicBool,
    stopped: CancellationToken,
}

impl LocalExecutor {
    pub fn new(settings: ExecutorSettings, command: Command, runner: Arc<dyn CommandRunner>) -> Self {
        let dir = JobDir::for_command(&settings, &command.id);
        Self {
            command,
            settings,
            dir,
            runner,
            pid: OnceLock::new(),
            child: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        }
    }

    pub fn restore(
        settings: ExecutorSettings,
        snapshot: &JobSnapshot,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let pid = OnceLock::new();
        if let Some(id) = &snapshot.job_id {
            let _ = pid.set(id.clone());
        }
        Self {
            command: snapshot.to_command(),
            settings,
            dir: JobDir::from_path(snapshot.job_dir.clone()),
            runner,
            pid,
            child: Mutex::new(None),
            started: AtomicBool::new(true),
            stopped: CancellationToken::new(),
        }
    }

    /// Join the owned child, if any. Returns whether it has exited.
    async fn join_child(&self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };
        tokio::select! {
            res = child.wait() => match res {
                Ok(status) => {
                    tracing::debug!(
                        command_id = %self.command.id,
                        exit_code = exit_code_of(status),
                        "Local process exited"
                    );
                    true
                }
                Err(e) => {
                    tracing::warn!(command_id = %self.command.id, error = %e, "Failed to wait on local process");
                    false
                }
            },
            _ = self.stopped.cancelled() => false,
        }
    }
}

/// Checks a pid with `kill -0`.
struct PidCheck<'a> {
    runner: &'a dyn CommandRunner,
    pid: &'a str,
}

#[async_trait]
impl Liveness for PidCheck<'_> {
    async fn alive(&self) -> bool {
        let check = ToolInvocation::new("kill").arg("-0").arg(self.pid);
        match self.runner.run(&check).await {
            Ok(output) => output.success(),
            Err(e) => {
                // Without a working check, fall back to waiting for the file.
                tracing::debug!(pid = self.pid, error = %e, "Liveness check failed");
                true
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    fn backend(&self) -> BackendType {
        BackendType::Local
    }

    fn command(&self) -> &Command {
        &self.command
    }

    fn job_dir(&self) -> &JobDir {
        &self.dir
    }

    fn job_id(&self) -> Option<String> {
        self.pid.get().cloned()
    }

    async fn start(&self, config: &BackendConfig) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ExecError::Submission(format!(
                "command {} was already started",
                self.command.id
            )));
        }
        config.normalized()?;

        let script = TemplateSubmitter::new(&self.dir, self.runner.as_ref())
            .prepare(&self.settings, &self.command, "")
            .await?;
        self.status();

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group, so stop() reaches the user command's children too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = tokio::process::Command::from(cmd).spawn().map_err(|e| {
            ExecError::Submission(format!("failed to spawn {}: {}", script.display(), e))
        })?;

        if let Some(pid) = child.id() {
            let _ = self.pid.set(pid.to_string());
            tracing::info!(command_id = %self.command.id, pid, "Started local process");
        }
        *self.child.lock().await = Some(child);
        self.status();
        Ok(())
    }

    fn status(&self) -> CommandStatus {
        let obs = Observation::observe(&self.dir, self.pid.get().is_some());
        self.command.advance(evaluate(&obs))
    }

    async fn wait_for(&self) -> i32 {
        let exited = self.join_child().await;

        // The wrapper renames the exit file into place before the shell
        // exits, so once the child is reaped the file is final.
        if let ExitFile::Code(code) = self.dir.read_exit() {
            self.command.advance(CommandStatus::Complete);
            return code;
        }
        if self.stopped.is_cancelled() {
            return EXIT_INDETERMINATE;
        }

        let job_id_known = || self.pid.get().is_some();
        let check = self.pid.get().map(|pid| PidCheck {
            runner: self.runner.as_ref(),
            pid,
        });
        let liveness: Option<&dyn Liveness> = match (&check, exited) {
            (_, true) => Some(&Exited as &dyn Liveness),
            (Some(check), false) => Some(check as &dyn Liveness),
            (None, false) => None,
        };
        poll::wait_for_exit(
            &self.command,
            &self.dir,
            &job_id_known,
            liveness,
            &self.settings.poll,
            &self.stopped,
        )
        .await
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.cancel();

        if self.status() == CommandStatus::Complete {
            return Ok(());
        }
        let Some(pid) = self.pid.get() else {
            return Ok(());
        };

        let invocation = ToolInvocation::new("kill")
            .arg("-TERM")
            .arg("--")
            .arg(format!("-{}", pid));
        let output = self.runner.run(&invocation).await.map_err(|e| ExecError::Stop {
            job_id: pid.clone(),
            stderr: e.to_string(),
        })?;
        if !output.success() {
            return Err(ExecError::Stop {
                job_id: pid.clone(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        tracing::info!(command_id = %self.command.id, pid = %pid, "Terminated local process group");
        Ok(())
    }

    fn ignorable_outputs(&self) -> Vec<String> {
        self.dir.bookkeeping_files()
    }

    fn status_message(&self) -> String {
        match self.pid.get() {
            Some(pid) => format!("Local process {} is {}", pid, self.command.status()),
            None => format!("Local process (not started) is {}", self.command.status()),
        }
    }
}

/// Exit code of a reaped process, using the shell's `128 + signal`
/// convention for signal deaths.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_INDETERMINATE
}
