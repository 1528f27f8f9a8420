//! Status evaluation and the polling wait loop shared by every backend.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandStatus};
use crate::config::PollPolicy;
use crate::error::ExecError;
use crate::jobdir::{ExitFile, JobDir};

/// Exit code reported when the real one cannot be determined, either
/// because the executor was stopped or because the exit-code file never
/// became readable.
pub const EXIT_INDETERMINATE: i32 = -1;

/// Point-in-time view of a job directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub script_exists: bool,
    pub job_id_known: bool,
    pub exit: ExitFile,
}

impl Observation {
    pub fn observe(dir: &JobDir, job_id_known: bool) -> Self {
        Self {
            script_exists: dir.script_exists(),
            job_id_known,
            exit: dir.read_exit(),
        }
    }
}

/// Map an observation onto the lifecycle ladder.
///
/// Stateless: the result depends only on what is on disk and whether a job
/// id was parsed. An exit-code file without a parseable integer does not
/// count as complete.
pub fn evaluate(obs: &Observation) -> CommandStatus {
    if let ExitFile::Code(_) = obs.exit {
        CommandStatus::Complete
    } else if obs.job_id_known {
        CommandStatus::Running
    } else if obs.script_exists {
        CommandStatus::Queueing
    } else {
        CommandStatus::Unknown
    }
}

/// Whether the process behind a job still exists.
///
/// Batch jobs have none; their absence of an exit file just means waiting.
#[async_trait]
pub trait Liveness: Send + Sync {
    async fn alive(&self) -> bool;
}

/// Liveness of a process already known to have exited.
pub struct Exited;

#[async_trait]
impl Liveness for Exited {
    async fn alive(&self) -> bool {
        false
    }
}

/// Poll `dir` until an exit code can be read or `stop` is cancelled.
///
/// The exit-code file is checked before the stop flag on every pass, so a
/// job that finished just as it was stopped still reports its real code.
/// With a `liveness` check, a missing exit file behind a dead process is
/// treated like an unreadable one: retried on the fine interval, then
/// reported as indeterminate.
pub async fn wait_for_exit(
    command: &Command,
    dir: &JobDir,
    job_id_known: &(dyn Fn() -> bool + Send + Sync),
    liveness: Option<&dyn Liveness>,
    policy: &PollPolicy,
    stop: &CancellationToken,
) -> i32 {
    let mut unparsed_reads = 0u32;

    loop {
        let obs = Observation::observe(dir, job_id_known());
        let status = command.advance(evaluate(&obs));
        let gone = obs.exit == ExitFile::Missing && process_gone(liveness).await;

        let interval = match obs.exit {
            ExitFile::Code(code) => {
                tracing::info!(command_id = %command.id, exit_code = code, "Command completed");
                return code;
            }
            ExitFile::Missing if !gone => policy.coarse_interval,
            ExitFile::Missing | ExitFile::Unparsed => {
                unparsed_reads += 1;
                if unparsed_reads > policy.exit_read_retries {
                    let err = ExecError::StatusIndeterminate(command.id.clone());
                    tracing::warn!(
                        command_id = %command.id,
                        retries = policy.exit_read_retries,
                        error = %err,
                        "Exit code file never became readable"
                    );
                    return EXIT_INDETERMINATE;
                }
                tracing::trace!(command_id = %command.id, attempt = unparsed_reads, "Exit code not yet flushed");
                policy.fine_interval
            }
        };

        if stop.is_cancelled() {
            tracing::info!(command_id = %command.id, %status, "Wait abandoned after stop");
            return EXIT_INDETERMINATE;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.cancelled() => {}
        }
    }
}

async fn process_gone(liveness: Option<&dyn Liveness>) -> bool {
    match liveness {
        Some(check) => !check.alive().await,
        None => false,
    }
}
