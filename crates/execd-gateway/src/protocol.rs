//! JSON messages exchanged with clients. Every message is an object whose
//! `event` field names its kind.

use chrono::{DateTime, Utc};
use execd_core::runtime::{RunEvent, RunEventKind};
use execd_core::{RunId, StreamKind};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    Initialize,
    Run { id: RunId, code: String },
    Stop { id: RunId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    Initialization,
    DuplicateRun,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Ready,
    Queued {
        id: RunId,
        position: usize,
    },
    Start {
        id: RunId,
    },
    Stdout {
        id: RunId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Stderr {
        id: RunId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Successful completion. `message` is the program's value, if it produced one.
    Output {
        id: RunId,
        message: Option<String>,
    },
    /// Run failure when `id` is set, connection-level failure otherwise.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RunId>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    Cancelled {
        id: RunId,
    },
}

impl OutboundMessage {
    pub fn error(id: Option<RunId>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            message: message.into(),
            code: Some(code),
        }
    }

    /// The run this message belongs to, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Ready => None,
            Self::Error { id, .. } => id.as_ref(),
            Self::Queued { id, .. }
            | Self::Start { id }
            | Self::Stdout { id, .. }
            | Self::Stderr { id, .. }
            | Self::Output { id, .. }
            | Self::Cancelled { id } => Some(id),
        }
    }

    /// Whether this is the last message a run will ever produce.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Output { .. } | Self::Cancelled { .. } => true,
            Self::Error { id, .. } => id.is_some(),
            _ => false,
        }
    }
}

impl From<RunEvent> for OutboundMessage {
    fn from(event: RunEvent) -> Self {
        let id = event.run_id;
        match event.kind {
            RunEventKind::Queued { position } => Self::Queued { id, position },
            RunEventKind::Started => Self::Start { id },
            RunEventKind::Log(line) => match line.kind {
                StreamKind::Stdout => Self::Stdout {
                    id,
                    message: line.text,
                    timestamp: line.timestamp,
                },
                StreamKind::Stderr => Self::Stderr {
                    id,
                    message: line.text,
                    timestamp: line.timestamp,
                },
            },
            RunEventKind::Completed { output } => Self::Output {
                id,
                message: output,
            },
            RunEventKind::Failed { message } => {
                Self::error(Some(id), ErrorCode::Execution, message)
            }
            RunEventKind::Cancelled => Self::Cancelled { id },
        }
    }
}

pub fn decode(text: &str) -> Result<InboundMessage> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode(message: &OutboundMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
