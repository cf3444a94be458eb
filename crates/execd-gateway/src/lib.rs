pub mod error;
pub mod gateway;
pub mod protocol;
pub mod server;

pub use error::GatewayError;
pub use gateway::{ChannelGateway, ClientConnection, HealthReport};
pub use protocol::{ErrorCode, InboundMessage, OutboundMessage};
pub use server::{GatewayHost, GatewayHostConfig};
