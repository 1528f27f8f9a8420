pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod jobdir;
pub mod recovery;
pub mod shutdown;
pub mod template;
pub mod tracker;

pub use command::{Command, CommandStatus};
pub use config::{BackendConfig, ExecutorSettings, PollPolicy};
pub use error::{ExecError, Result};
pub use executor::{create_executor, BackendType, CommandExecutor, ExecutionResult, EXIT_INDETERMINATE};
pub use recovery::{JobSnapshot, RecoveryStore};
pub use tracker::JobTracker;
