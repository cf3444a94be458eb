use execd_core::ClientId;
use tokio::sync::mpsc;

use super::RouterCmd;
use crate::protocol::OutboundMessage;

/// One connected client's view of the gateway.
///
/// Dropping the connection disconnects the client: its queued runs are
/// cancelled and its executing run, if any, is asked to stop.
pub struct ClientConnection {
    client_id: ClientId,
    rx: mpsc::Receiver<OutboundMessage>,
    router_tx: mpsc::UnboundedSender<RouterCmd>,
}

impl ClientConnection {
    pub(super) fn new(
        client_id: ClientId,
        rx: mpsc::Receiver<OutboundMessage>,
        router_tx: mpsc::UnboundedSender<RouterCmd>,
    ) -> Self {
        Self {
            client_id,
            rx,
            router_tx,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Next message for this client, or `None` once the gateway has stopped.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let _ = self.router_tx.send(RouterCmd::Disconnect {
            client: self.client_id,
        });
    }
}
