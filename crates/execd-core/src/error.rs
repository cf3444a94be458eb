use thiserror::Error;

use crate::interpreter::InterpreterError;
use crate::types::RunId;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("Runtime initialization failed: {message}")]
    Initialization { message: String },

    #[error("Run already exists: {id}")]
    DuplicateRun { id: RunId },

    #[error("Output capture already registered for run: {id}")]
    AlreadyRegistered { id: RunId },

    #[error("{message}")]
    Execution { message: String },

    #[error("Runtime is not ready")]
    NotReady,

    #[error("Another run is already executing: {id}")]
    Busy { id: RunId },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Coordinator shutting down")]
    ShuttingDown,
}

impl CoordinatorError {
    /// Message suitable for the `message` field of an outbound `error` event.
    pub fn client_message(&self) -> String {
        match self {
            Self::Execution { message } | Self::Initialization { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<InterpreterError> for CoordinatorError {
    fn from(err: InterpreterError) -> Self {
        match err {
            InterpreterError::Bootstrap(message) => Self::Initialization { message },
            other => Self::Execution {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
