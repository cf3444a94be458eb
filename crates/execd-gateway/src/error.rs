use std::net::SocketAddr;

use execd_core::CoordinatorError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Server(#[source] std::io::Error),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("Invalid gateway state: {reason}")]
    InvalidState { reason: String },

    #[error("Channel closed")]
    ChannelClosed,
}
