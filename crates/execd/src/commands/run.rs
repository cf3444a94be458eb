use async_trait::async_trait;
use eyre::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::Command;
use crate::error::Error;
use execd_core::interpreter::ProcessInterpreter;
use execd_core::{Coordinator, CoordinatorConfig, RunId};
use execd_gateway::{ChannelGateway, ClientConnection, InboundMessage, OutboundMessage};

/// Executes one program through an in-process coordinator, streaming its
/// output to this terminal the way a gateway client would see it.
pub struct RunCommand {
    pub config: CoordinatorConfig,
    pub path: PathBuf,
    pub id: String,
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self) -> Result<()> {
        let code = read_source(&self.path).await?;
        let id = RunId::new(self.id.clone());

        let interpreter = Arc::new(ProcessInterpreter::new(self.config.interpreter.clone()));
        let (coordinator, events) = Coordinator::spawn(interpreter, &self.config);
        let gateway = ChannelGateway::spawn(&coordinator, events);
        let mut client = gateway.connect().map_err(Error::from)?;

        gateway
            .handle_message(
                client.client_id(),
                InboundMessage::Run {
                    id: id.clone(),
                    code,
                },
            )
            .await
            .map_err(Error::from)?;

        let result = follow_run(&gateway, &mut client, &id).await;

        drop(client);
        gateway.shutdown();
        coordinator.shutdown().await;

        Ok(result?)
    }
}

async fn read_source(path: &Path) -> std::result::Result<String, Error> {
    let mut code = String::new();
    if path.as_os_str() == "-" {
        tokio::io::stdin().read_to_string(&mut code).await?;
    } else {
        code = tokio::fs::read_to_string(path).await?;
    }
    Ok(code)
}

async fn follow_run(
    gateway: &ChannelGateway,
    client: &mut ClientConnection,
    id: &RunId,
) -> std::result::Result<(), Error> {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut stop_sent = false;

    loop {
        let message = tokio::select! {
            message = client.recv() => message,
            signal = tokio::signal::ctrl_c(), if !stop_sent => {
                signal?;
                info!(run_id = %id, "Interrupted; stopping run");
                stop_sent = true;
                gateway
                    .handle_message(client.client_id(), InboundMessage::Stop { id: id.clone() })
                    .await?;
                continue;
            }
        };

        let Some(message) = message else {
            return Err(Error::Disconnected { id: id.clone() });
        };

        match message {
            OutboundMessage::Stdout { message, .. } => writeln!(stdout, "{message}")?,
            OutboundMessage::Stderr { message, .. } => writeln!(stderr, "{message}")?,
            OutboundMessage::Output { message, .. } => {
                if let Some(value) = message {
                    writeln!(stdout, "{value}")?;
                }
                return Ok(());
            }
            OutboundMessage::Cancelled { .. } => {
                return Err(Error::RunCancelled { id: id.clone() });
            }
            OutboundMessage::Error {
                id: Some(_),
                message,
                ..
            } => {
                return Err(Error::RunFailed {
                    id: id.clone(),
                    message,
                });
            }
            other => debug!(run_id = %id, message = ?other, "Gateway event"),
        }
    }
}
