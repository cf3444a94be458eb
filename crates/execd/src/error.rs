use execd_core::RunId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] execd_core::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gateway(#[from] execd_gateway::GatewayError),

    #[error("Run {id} failed: {message}")]
    RunFailed { id: RunId, message: String },

    #[error("Run {id} was cancelled")]
    RunCancelled { id: RunId },

    #[error("Gateway closed before run {id} finished")]
    Disconnected { id: RunId },
}
