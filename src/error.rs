use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Exit status indeterminate for command {0}")]
    StatusIndeterminate(String),

    #[error("Failed to stop job {job_id}: {stderr}")]
    Stop { job_id: String, stderr: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
