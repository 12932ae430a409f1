use thiserror::Error;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid job parameters: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Render node not found: {0}")]
    NodeNotFound(String),

    #[error("Cannot {operation} job {job_id} while it is {status}")]
    JobStatus {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Remote command failed on {node}: {message}")]
    RemoteControl { node: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command not allowed: {0}")]
    UnknownCommand(String),

    #[error("Invalid arguments for {command}: {message}")]
    InvalidArguments { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControllerError {
    /// Stable name of the error kind, sent to protocol clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Validation(_) => "ValidationError",
            ControllerError::JobNotFound(_) => "JobNotFoundError",
            ControllerError::NodeNotFound(_) => "NodeNotFoundError",
            ControllerError::JobStatus { .. } => "JobStatusError",
            ControllerError::RemoteControl { .. } => "RemoteControlFailure",
            ControllerError::Persistence(_) => "PersistenceFailure",
            ControllerError::Protocol(_) => "ProtocolError",
            ControllerError::UnknownCommand(_) => "UnknownCommand",
            ControllerError::InvalidArguments { .. } => "InvalidArguments",
            ControllerError::Io(_) => "IoError",
            ControllerError::Json(_) => "JsonError",
        }
    }

    pub(crate) fn status(job_id: &str, status: JobStatus, operation: &'static str) -> Self {
        ControllerError::JobStatus {
            job_id: job_id.to_string(),
            status,
            operation,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
