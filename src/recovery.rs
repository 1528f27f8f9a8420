//! Cross-restart recovery.
//!
//! While a command is in flight its [`JobSnapshot`] is persisted under
//! `<workroot>/commands/<id>.json`. A restarted controller loads the
//! snapshots and calls [`restore`] to reattach executors without
//! resubmitting. Runtime handles (child processes, stop flags) are never
//! persisted; restored executors poll the job directory instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::config::ExecutorSettings;
use crate::error::Result;
use crate::executor::{
    BackendType, CommandExecutor, CommandRunner, LocalExecutor, Sge, SgeExecutor, Slurm,
    SlurmExecutor,
};

/// Persisted identity of an in-flight command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub command_id: String,
    pub name: String,
    pub text: String,
    pub workdir: PathBuf,
    pub backend: BackendType,
    pub job_dir: PathBuf,
    pub job_id: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn capture<E: CommandExecutor + ?Sized>(executor: &E) -> Self {
        let command = executor.command();
        Self {
            command_id: command.id.clone(),
            name: command.name.clone(),
            text: command.text.clone(),
            workdir: command.workdir.clone(),
            backend: executor.backend(),
            job_dir: executor.job_dir().path().to_path_buf(),
            job_id: executor.job_id(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild the command. Its status starts at `Unknown` and catches up on
    /// the first `status()` call.
    pub fn to_command(&self) -> Command {
        Command::new(&self.command_id, &self.name, &self.text).with_workdir(&self.workdir)
    }
}

/// Reconstruct the executor that produced `snapshot`.
pub fn restore(
    snapshot: &JobSnapshot,
    settings: ExecutorSettings,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn CommandExecutor> {
    tracing::info!(
        command_id = %snapshot.command_id,
        backend = %snapshot.backend,
        job_id = ?snapshot.job_id,
        "Restoring executor"
    );
    match snapshot.backend {
        BackendType::Local => Arc::new(LocalExecutor::restore(settings, snapshot, runner)),
        BackendType::Sge => Arc::new(SgeExecutor::restore(Sge, settings, snapshot, runner)),
        BackendType::Slurm => Arc::new(SlurmExecutor::restore(Slurm, settings, snapshot, runner)),
    }
}

/// Directory of persisted snapshots, one JSON file per command.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    dir: PathBuf,
}

impl RecoveryStore {
    pub fn new(settings: &ExecutorSettings) -> Self {
        Self {
            dir: settings.recovery_dir(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, command_id: &str) -> PathBuf {
        let file: String = command_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    /// Persist atomically: write a temp file, then rename over the target.
    pub async fn save(&self, snapshot: &JobSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.command_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(command_id = %snapshot.command_id, path = %path.display(), "Saved snapshot");
        Ok(())
    }

    pub async fn load(&self, command_id: &str) -> Result<Option<JobSnapshot>> {
        match tokio::fs::read(self.path_for(command_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable snapshot, oldest first. Corrupt files are logged and
    /// skipped so one bad entry cannot block recovery of the rest.
    pub async fn load_all(&self) -> Result<Vec<JobSnapshot>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<JobSnapshot>(&bytes) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot")
                }
            }
        }
        snapshots.sort_by_key(|s| s.saved_at);
        Ok(snapshots)
    }

    /// Remove a snapshot. Missing files are not an error.
    pub async fn remove(&self, command_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(command_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
