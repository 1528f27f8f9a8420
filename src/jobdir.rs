//! On-disk protocol between the controller and a running job.
//!
//! Every command owns `<workroot>/commandtmp/<id>/`. The wrapper script runs
//! the user command and, as its last action, renames a finished exit-code
//! file into place. The presence of a parseable `cmd.exit` is the only
//! signal that the job has finished.

use std::path::{Path, PathBuf};

use crate::config::ExecutorSettings;
use crate::error::{ExecError, Result};

pub const WRAPPER_SCRIPT: &str = "cmd.sh";
pub const EXIT_FILE: &str = "cmd.exit";
pub const STDOUT_FILE: &str = "cmd.out";
pub const STDERR_FILE: &str = "cmd.err";

/// What the exit-code file currently says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitFile {
    Missing,
    /// Present but empty or not yet an integer (content not flushed).
    Unparsed,
    Code(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDir {
    path: PathBuf,
}

impl JobDir {
    pub fn for_command(settings: &ExecutorSettings, command_id: &str) -> Self {
        Self {
            path: settings.command_tmp_dir().join(dir_name(command_id)),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn script_path(&self) -> PathBuf {
        self.file(WRAPPER_SCRIPT)
    }

    pub fn exit_path(&self) -> PathBuf {
        self.file(EXIT_FILE)
    }

    pub fn exit_tmp_path(&self) -> PathBuf {
        self.file(&format!("{}.tmp", EXIT_FILE))
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.file(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.file(STDERR_FILE)
    }

    /// Create the directory if absent and wait until it is visible.
    pub async fn create(&self, settings: &ExecutorSettings) -> Result<()> {
        tokio::fs::create_dir_all(&self.path).await.map_err(|e| {
            ExecError::Submission(format!(
                "cannot create job directory {}: {}",
                self.path.display(),
                e
            ))
        })?;

        for attempt in 0..=settings.dir_visibility_retries {
            if tokio::fs::metadata(&self.path).await.is_ok() {
                return Ok(());
            }
            tracing::debug!(
                path = %self.path.display(),
                attempt,
                "Job directory not yet visible"
            );
            tokio::time::sleep(settings.dir_visibility_interval).await;
        }

        Err(ExecError::Submission(format!(
            "job directory {} not visible after creation",
            self.path.display()
        )))
    }

    /// Write the rendered wrapper script and mark it executable.
    pub async fn write_script(&self, content: &str) -> Result<PathBuf> {
        let script = self.script_path();
        tokio::fs::write(&script, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(script)
    }

    pub fn script_exists(&self) -> bool {
        self.script_path().is_file()
    }

    pub fn read_exit(&self) -> ExitFile {
        match std::fs::read_to_string(self.exit_path()) {
            Ok(content) => match content.trim().parse::<i32>() {
                Ok(code) => ExitFile::Code(code),
                Err(_) => ExitFile::Unparsed,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ExitFile::Missing,
            // A file we cannot read yet still signals that the job is ending.
            Err(_) => {
                if self.exit_path().exists() {
                    ExitFile::Unparsed
                } else {
                    ExitFile::Missing
                }
            }
        }
    }

    /// Record an exit code the same way the wrapper does: temp file, then
    /// rename over the final name.
    pub fn write_exit_code(&self, code: i32) -> Result<()> {
        let tmp = self.exit_tmp_path();
        std::fs::write(&tmp, format!("{}\n", code))?;
        std::fs::rename(&tmp, self.exit_path())?;
        Ok(())
    }

    /// Captured stdout/stderr of the user command. Empty streams read as `None`.
    pub async fn read_output(&self) -> (Option<String>, Option<String>) {
        (
            read_non_empty(&self.stdout_path()).await,
            read_non_empty(&self.stderr_path()).await,
        )
    }

    /// Paths this protocol creates that are never stage output.
    pub fn bookkeeping_files(&self) -> Vec<String> {
        [
            self.script_path(),
            self.exit_path(),
            self.exit_tmp_path(),
            self.stdout_path(),
            self.stderr_path(),
        ]
        .iter()
        .map(|p| p.display().to_string())
        .collect()
    }
}

async fn read_non_empty(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).to_string())
    }
}

/// Directory name for a command id. Path separators cannot escape the
/// `commandtmp` root.
fn dir_name(command_id: &str) -> String {
    let name: String = command_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        "_".to_string()
    } else {
        name.to_string()
    }
}
