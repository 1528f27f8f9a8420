use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Lifecycle of a command. Variants are declared in progression order, so
/// `Ord` follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Unknown,
    Queueing,
    Running,
    Complete,
}

impl CommandStatus {
    fn as_u8(self) -> u8 {
        match self {
            CommandStatus::Unknown => 0,
            CommandStatus::Queueing => 1,
            CommandStatus::Running => 2,
            CommandStatus::Complete => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CommandStatus::Queueing,
            2 => CommandStatus::Running,
            3 => CommandStatus::Complete,
            _ => CommandStatus::Unknown,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Unknown => write!(f, "UNKNOWN"),
            CommandStatus::Queueing => write!(f, "QUEUEING"),
            CommandStatus::Running => write!(f, "RUNNING"),
            CommandStatus::Complete => write!(f, "COMPLETE"),
        }
    }
}

impl FromStr for CommandStatus {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(CommandStatus::Unknown),
            "QUEUEING" => Ok(CommandStatus::Queueing),
            "RUNNING" => Ok(CommandStatus::Running),
            "COMPLETE" => Ok(CommandStatus::Complete),
            other => Err(ExecError::Configuration(format!(
                "invalid command status '{}'",
                other
            ))),
        }
    }
}

/// A unit of work dispatched by the pipeline.
///
/// The status field only moves forward: observations that would regress it
/// are ignored, which keeps `status()` monotonic even when the job directory
/// is observed mid-update.
#[derive(Debug)]
pub struct Command {
    pub id: String,
    pub name: String,
    pub text: String,
    pub workdir: PathBuf,
    status: AtomicU8,
}

impl Command {
    pub fn new(id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            text: text.into(),
            workdir: PathBuf::from("."),
            status: AtomicU8::new(CommandStatus::Unknown.as_u8()),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn status(&self) -> CommandStatus {
        CommandStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move the status forward to `observed` if it is further along, and
    /// return the resulting status.
    pub fn advance(&self, observed: CommandStatus) -> CommandStatus {
        let previous = self.status.fetch_max(observed.as_u8(), Ordering::AcqRel);
        CommandStatus::from_u8(previous.max(observed.as_u8()))
    }
}

impl Clone for Command {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            text: self.text.clone(),
            workdir: self.workdir.clone(),
            status: AtomicU8::new(self.status.load(Ordering::Acquire)),
        }
    }
}
