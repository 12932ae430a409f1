//! Client command protocol.
//!
//! One request and one reply per TCP connection, each framed by [`frame`].
//! A request is `{"command": name, "args": [...], "kwargs": {...}}`; the reply is
//! `{"ok": value}` or `{"error": {"kind": ..., "message": ...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ControllerError;

pub mod client;
pub mod commands;
pub mod frame;
pub mod server;

pub use client::send_request;
pub use commands::{execute, ALLOWED_COMMANDS};
pub use server::ProtocolServer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    Ok(Value),
    Error(ErrorReply),
}

impl Reply {
    pub fn into_result(self) -> Result<Value, ErrorReply> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Error(e) => Err(e),
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Reply::Ok(_) => None,
            Reply::Error(e) => Some(&e.kind),
        }
    }
}

impl From<crate::error::Result<Value>> for Reply {
    fn from(result: crate::error::Result<Value>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::from(e),
        }
    }
}

impl From<ControllerError> for Reply {
    fn from(e: ControllerError) -> Self {
        Reply::Error(ErrorReply {
            kind: e.kind().to_string(),
            message: e.to_string(),
        })
    }
}
