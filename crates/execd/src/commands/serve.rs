use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

use super::Command;
use execd_core::interpreter::ProcessInterpreter;
use execd_core::{Coordinator, CoordinatorConfig};
use execd_gateway::{ChannelGateway, GatewayHost, GatewayHostConfig};

pub struct ServeCommand {
    pub config: CoordinatorConfig,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let mut server = self.config.server.clone();
        if let Some(bind) = self.bind {
            server.bind = bind;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        let addr = server.socket_addr();

        let interpreter = Arc::new(ProcessInterpreter::new(self.config.interpreter.clone()));
        let (coordinator, events) = Coordinator::spawn(interpreter, &self.config);
        let gateway =
            ChannelGateway::with_client_buffer(&coordinator, events, server.client_buffer);

        let mut host = GatewayHost::new(gateway, GatewayHostConfig { bind_addr: addr });
        let local_addr = host
            .start()
            .await
            .map_err(|e| eyre!("Failed to start server: {}", e))?;

        let mut stdout = std::io::stdout();
        writeln!(stdout, "Gateway listening on ws://{local_addr}/ws")?;
        writeln!(stdout, "Press Ctrl+C to shutdown")?;

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
            }
            result = host.wait() => {
                coordinator.shutdown().await;
                return Err(match result {
                    Ok(()) => eyre!("Server stopped unexpectedly"),
                    Err(e) => eyre!("Server failed: {}", e),
                });
            }
        }

        host.shutdown()
            .await
            .map_err(|e| eyre!("Failed to shutdown server: {}", e))?;
        coordinator.shutdown().await;
        info!("Server shutdown complete");

        Ok(())
    }
}
