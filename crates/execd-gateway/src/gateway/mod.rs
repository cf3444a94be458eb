//! Transport-independent client handling.
//!
//! A [`ChannelGateway`] accepts clients, decodes their messages into ledger and
//! supervisor calls, and routes every run event back to the client that owns
//! the run. Transports (the WebSocket host, the CLI) sit on top of
//! [`ClientConnection`]s.

mod connection;

use std::collections::HashMap;
use std::sync::Arc;

use execd_core::Coordinator;
use execd_core::runtime::{
    CancelOutcome, Readiness, RunEvent, RunEventStream, RunLedgerHandle, RuntimeStatus,
    RuntimeSupervisor,
};
use execd_core::{ClientId, CoordinatorError, RunId};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::protocol::{self, ErrorCode, InboundMessage, OutboundMessage};

pub use connection::ClientConnection;

/// Outbound messages a client may have pending before it is dropped.
pub const DEFAULT_CLIENT_BUFFER: usize = 1024;

type ClientSender = mpsc::Sender<OutboundMessage>;

struct ClientSlot {
    tx: ClientSender,
    ready_sent: bool,
}

pub(crate) enum RouterCmd {
    Connect {
        client: ClientId,
        tx: ClientSender,
    },
    Disconnect {
        client: ClientId,
    },
    Deliver {
        client: ClientId,
        message: OutboundMessage,
    },
    /// `ready` for a client whose `initialize` found the runtime already up.
    /// Each client is sent `ready` at most once; while the broadcast is still
    /// pending it covers this client too.
    AnnounceReady {
        client: ClientId,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: RuntimeStatus,
    pub queued: usize,
    pub executing: Option<RunId>,
}

/// Owns the client registry. Runs as a single task so that connects,
/// disconnects and event delivery are applied in one order.
struct Router {
    clients: HashMap<ClientId, ClientSlot>,
    ledger: RunLedgerHandle,
    ready_announced: bool,
}

impl Router {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<RouterCmd>,
        mut events: RunEventStream,
        mut status: watch::Receiver<RuntimeStatus>,
        shutdown: CancellationToken,
    ) {
        // Only transitions after startup are broadcast.
        self.ready_announced = *status.borrow_and_update() == RuntimeStatus::Ready;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd),

                Ok(()) = status.changed() => {
                    let current = *status.borrow_and_update();
                    if current == RuntimeStatus::Ready && !self.ready_announced {
                        self.ready_announced = true;
                        self.announce_ready();
                    }
                }

                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }

        info!(clients = self.clients.len(), "Gateway router stopped");
    }

    fn handle_cmd(&mut self, cmd: RouterCmd) {
        match cmd {
            RouterCmd::Connect { client, tx } => {
                self.clients.insert(
                    client,
                    ClientSlot {
                        tx,
                        ready_sent: false,
                    },
                );
                info!(client_id = %client, clients = self.clients.len(), "Client connected");
            }
            RouterCmd::Disconnect { client } => {
                if self.drop_client(client) {
                    info!(client_id = %client, clients = self.clients.len(), "Client disconnected");
                }
            }
            RouterCmd::Deliver { client, message } => self.send(client, message),
            RouterCmd::AnnounceReady { client } => {
                if self.ready_announced {
                    self.send_ready(client);
                } else {
                    debug!(client_id = %client, "Ready broadcast pending; no direct reply");
                }
            }
            RouterCmd::ClientCount { reply } => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn route(&mut self, event: RunEvent) {
        let owner = event.owner;
        self.send(owner, event.into());
    }

    fn send(&mut self, client: ClientId, message: OutboundMessage) {
        let Some(slot) = self.clients.get(&client) else {
            debug!(client_id = %client, run_id = ?message.run_id(), "Dropping message for departed client");
            return;
        };
        if let Err(e) = slot.tx.try_send(message) {
            self.reject(client, &e);
        }
    }

    fn send_ready(&mut self, client: ClientId) {
        let Some(slot) = self.clients.get_mut(&client) else {
            return;
        };
        if std::mem::replace(&mut slot.ready_sent, true) {
            return;
        }
        self.send(client, OutboundMessage::Ready);
    }

    fn announce_ready(&mut self) {
        debug!(clients = self.clients.len(), "Announcing runtime readiness");
        let clients: Vec<ClientId> = self.clients.keys().copied().collect();
        for client in clients {
            self.send_ready(client);
        }
    }

    fn reject(&mut self, client: ClientId, error: &TrySendError<OutboundMessage>) {
        match error {
            TrySendError::Full(_) => {
                warn!(client_id = %client, "Client is not keeping up with its output; disconnecting");
            }
            TrySendError::Closed(_) => debug!(client_id = %client, "Client channel closed"),
        }
        self.drop_client(client);
    }

    /// Forgets `client` and releases its runs. Returns whether it was known.
    fn drop_client(&mut self, client: ClientId) -> bool {
        if self.clients.remove(&client).is_none() {
            return false;
        }

        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            if let Err(e) = ledger.release_client(client).await {
                debug!(client_id = %client, error = %e, "Could not release client runs");
            }
        });
        true
    }
}

#[derive(Clone)]
pub struct ChannelGateway {
    supervisor: Arc<RuntimeSupervisor>,
    ledger: RunLedgerHandle,
    router_tx: mpsc::UnboundedSender<RouterCmd>,
    shutdown: CancellationToken,
    client_buffer: usize,
}

impl ChannelGateway {
    /// Starts routing `events` (the stream returned alongside `coordinator`).
    pub fn spawn(coordinator: &Coordinator, events: RunEventStream) -> Self {
        Self::with_client_buffer(coordinator, events, DEFAULT_CLIENT_BUFFER)
    }

    /// Like [`ChannelGateway::spawn`], holding at most `client_buffer`
    /// undelivered messages per client. A client that falls further behind is
    /// disconnected and its runs are released.
    pub fn with_client_buffer(
        coordinator: &Coordinator,
        events: RunEventStream,
        client_buffer: usize,
    ) -> Self {
        let supervisor = coordinator.supervisor();
        let ledger = coordinator.ledger();
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let router = Router {
            clients: HashMap::new(),
            ledger: ledger.clone(),
            ready_announced: false,
        };
        tokio::spawn(router.run(
            router_rx,
            events,
            supervisor.subscribe_status(),
            shutdown.clone(),
        ));

        Self {
            supervisor,
            ledger,
            router_tx,
            shutdown,
            client_buffer: client_buffer.max(1),
        }
    }

    /// Registers a new client. Warming up the runtime starts in the background.
    pub fn connect(&self) -> Result<ClientConnection> {
        let client = ClientId::new();
        let (tx, rx) = mpsc::channel(self.client_buffer);
        self.router_tx
            .send(RouterCmd::Connect { client, tx })
            .map_err(|_| GatewayError::ChannelClosed)?;

        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.ensure_ready().await {
                warn!(client_id = %client, error = %e, "Background runtime warm-up failed");
            }
        });

        Ok(ClientConnection::new(client, rx, self.router_tx.clone()))
    }

    /// Handles one raw text frame. Malformed frames are answered with an
    /// `error` event and otherwise ignored.
    pub async fn handle_frame(&self, client: ClientId, text: &str) -> Result<()> {
        match protocol::decode(text) {
            Ok(message) => self.handle_message(client, message).await,
            Err(e) => {
                warn!(client_id = %client, error = %e, "Rejected malformed message");
                self.deliver(
                    client,
                    OutboundMessage::error(None, ErrorCode::InvalidMessage, e.to_string()),
                );
                Ok(())
            }
        }
    }

    pub async fn handle_message(&self, client: ClientId, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Initialize => {
                let gateway = self.clone();
                tokio::spawn(async move { gateway.initialize(client).await });
                Ok(())
            }
            InboundMessage::Run { id, code } => {
                debug!(client_id = %client, run_id = %id, "Run requested");
                match self.ledger.submit(id.clone(), code, client).await {
                    Ok(_) => Ok(()),
                    Err(e @ CoordinatorError::DuplicateRun { .. }) => {
                        self.deliver(
                            client,
                            OutboundMessage::error(
                                Some(id),
                                ErrorCode::DuplicateRun,
                                e.client_message(),
                            ),
                        );
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            InboundMessage::Stop { id } => {
                let outcome = self.ledger.cancel(id.clone(), Some(client)).await?;
                match outcome {
                    CancelOutcome::Dequeued | CancelOutcome::Signalled => {
                        debug!(client_id = %client, run_id = %id, ?outcome, "Stop accepted");
                    }
                    CancelOutcome::NotFound | CancelOutcome::NotOwner => {
                        debug!(client_id = %client, run_id = %id, ?outcome, "Stop ignored");
                    }
                }
                Ok(())
            }
        }
    }

    async fn initialize(&self, client: ClientId) {
        match self.supervisor.ensure_ready().await {
            Ok(Readiness::AlreadyReady) => {
                if self
                    .router_tx
                    .send(RouterCmd::AnnounceReady { client })
                    .is_err()
                {
                    debug!(client_id = %client, "Router stopped; ready dropped");
                }
            }
            // Everyone connected hears about the transition from the router.
            Ok(Readiness::Bootstrapped) => {}
            Err(e) => {
                warn!(client_id = %client, error = %e, "Initialization failed");
                self.deliver(
                    client,
                    OutboundMessage::error(None, ErrorCode::Initialization, e.client_message()),
                );
            }
        }
    }

    fn deliver(&self, client: ClientId, message: OutboundMessage) {
        if self
            .router_tx
            .send(RouterCmd::Deliver { client, message })
            .is_err()
        {
            debug!(client_id = %client, "Router stopped; message dropped");
        }
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let snapshot = self.ledger.snapshot().await?;
        Ok(HealthReport {
            status: self.supervisor.status(),
            queued: snapshot.queued.len(),
            executing: snapshot.executing,
        })
    }

    pub async fn client_count(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.router_tx
            .send(RouterCmd::ClientCount { reply: reply_tx })
            .map_err(|_| GatewayError::ChannelClosed)?;
        reply_rx.await.map_err(|_| GatewayError::ChannelClosed)
    }

    /// Stops routing. Connected clients see their streams end.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
