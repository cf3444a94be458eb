use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::event::{RunEvent, RunEventKind, RunEventSender, RunOutcome};
use super::supervisor::{ExecutionRequest, RuntimeStatus, RuntimeSupervisor};
use crate::config::LedgerConfig;
use crate::error::CoordinatorError;
use crate::types::{ClientId, RunId, RunState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was still queued and has been dropped.
    Dequeued,
    /// The run is executing; its token has been fired and it will stop at the
    /// interpreter's next checkpoint, unless it finishes first.
    Signalled,
    NotFound,
    /// The requester does not own the run. Nothing was done.
    NotOwner,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub queued: Vec<RunId>,
    pub executing: Option<RunId>,
}

pub(crate) enum LedgerCmd {
    Submit {
        id: RunId,
        code: String,
        owner: ClientId,
        reply: oneshot::Sender<Result<usize, CoordinatorError>>,
    },
    Cancel {
        id: RunId,
        requester: Option<ClientId>,
        reply: oneshot::Sender<CancelOutcome>,
    },
    ReleaseClient {
        client: ClientId,
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<LedgerSnapshot>,
    },
    Shutdown,
}

enum LedgerAction {
    Finished { id: RunId, outcome: RunOutcome },
    RuntimeReady(Result<(), CoordinatorError>),
}

struct Run {
    owner: ClientId,
    code: String,
    created_at: DateTime<Utc>,
    state: RunState,
}

struct Executing {
    id: RunId,
    token: CancellationToken,
}

/// Authoritative record of every non-terminal run.
///
/// Owns the global FIFO queue and the single executing slot. Runs are started
/// strictly in arrival order and only one is ever handed to the supervisor at a
/// time; terminal runs are reported once and then forgotten.
struct RunLedger {
    supervisor: Arc<RuntimeSupervisor>,
    events: RunEventSender,
    runs: HashMap<RunId, Run>,
    queue: VecDeque<RunId>,
    executing: Option<Executing>,
    awaiting_runtime: bool,
    shutting_down: bool,
    action_tx: mpsc::UnboundedSender<LedgerAction>,
}

impl RunLedger {
    fn new(
        supervisor: Arc<RuntimeSupervisor>,
        events: RunEventSender,
        action_tx: mpsc::UnboundedSender<LedgerAction>,
    ) -> Self {
        Self {
            supervisor,
            events,
            runs: HashMap::new(),
            queue: VecDeque::new(),
            executing: None,
            awaiting_runtime: false,
            shutting_down: false,
            action_tx,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<LedgerCmd>,
        mut action_rx: mpsc::UnboundedReceiver<LedgerAction>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(action) = action_rx.recv() => self.handle_action(action),

                cmd = cmd_rx.recv() => match cmd {
                    Some(LedgerCmd::Shutdown) | None => {
                        self.shutdown_all(&mut cmd_rx, &mut action_rx).await;
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd),
                },
            }
        }

        info!("Run ledger stopped");
    }

    fn handle_cmd(&mut self, cmd: LedgerCmd) {
        match cmd {
            LedgerCmd::Submit {
                id,
                code,
                owner,
                reply,
            } => {
                let result = self.submit(id, code, owner);
                let _ = reply.send(result);
            }
            LedgerCmd::Cancel {
                id,
                requester,
                reply,
            } => {
                let outcome = self.cancel(&id, requester);
                let _ = reply.send(outcome);
            }
            LedgerCmd::ReleaseClient { client, reply } => {
                let released = self.release_client(client);
                let _ = reply.send(released);
            }
            LedgerCmd::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            LedgerCmd::Shutdown => debug!("Run ledger already shutting down"),
        }
    }

    fn emit(&self, run_id: &RunId, owner: ClientId, kind: RunEventKind) {
        let event = RunEvent {
            run_id: run_id.clone(),
            owner,
            kind,
        };
        if self.events.send(event).is_err() {
            trace!(run_id = %run_id, "Run event receiver dropped");
        }
    }

    fn submit(
        &mut self,
        id: RunId,
        code: String,
        owner: ClientId,
    ) -> Result<usize, CoordinatorError> {
        if self.shutting_down {
            return Err(CoordinatorError::ShuttingDown);
        }
        if self.runs.contains_key(&id) {
            return Err(CoordinatorError::DuplicateRun { id });
        }

        let position = self.queue.len();
        self.runs.insert(
            id.clone(),
            Run {
                owner,
                code,
                created_at: Utc::now(),
                state: RunState::Queued,
            },
        );
        self.queue.push_back(id.clone());
        debug!(run_id = %id, client_id = %owner, position, "Run queued");
        self.emit(&id, owner, RunEventKind::Queued { position });

        self.maybe_start_next();
        Ok(position)
    }

    fn maybe_start_next(&mut self) {
        if self.shutting_down || self.executing.is_some() || self.awaiting_runtime {
            return;
        }
        let Some(id) = self.queue.front().cloned() else {
            return;
        };

        if self.supervisor.status() != RuntimeStatus::Ready {
            self.awaiting_runtime = true;
            debug!(run_id = %id, "Waiting for runtime before starting run");
            let supervisor = self.supervisor.clone();
            let action_tx = self.action_tx.clone();
            tokio::spawn(async move {
                let result = supervisor.ensure_ready().await.map(|_| ());
                let _ = action_tx.send(LedgerAction::RuntimeReady(result));
            });
            return;
        }

        self.queue.pop_front();
        let Some(run) = self.runs.get_mut(&id) else {
            warn!(run_id = %id, "Queued run missing from ledger");
            return;
        };
        run.state = RunState::Executing;
        let owner = run.owner;
        let request = ExecutionRequest {
            run_id: id.clone(),
            owner,
            code: run.code.clone(),
        };

        let token = CancellationToken::new();
        self.executing = Some(Executing {
            id: id.clone(),
            token: token.clone(),
        });
        info!(run_id = %id, client_id = %owner, "Run started");
        self.emit(&id, owner, RunEventKind::Started);

        let supervisor = self.supervisor.clone();
        let action_tx = self.action_tx.clone();
        tokio::spawn(async move {
            // The inner task isolates panics so the slot is always released.
            let execution = tokio::spawn(async move { supervisor.execute(request, token).await });
            let outcome = match execution.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => RunOutcome::Failed(e.client_message()),
                Err(e) => RunOutcome::Failed(format!("Execution task failed: {e}")),
            };
            let _ = action_tx.send(LedgerAction::Finished { id, outcome });
        });
    }

    fn handle_action(&mut self, action: LedgerAction) {
        match action {
            LedgerAction::Finished { id, outcome } => self.finish(&id, outcome),
            LedgerAction::RuntimeReady(result) => {
                self.awaiting_runtime = false;
                if let Err(e) = result {
                    if let Some(id) = self.queue.pop_front() {
                        warn!(run_id = %id, error = %e, "Runtime unavailable, failing run");
                        self.conclude(&id, RunOutcome::Failed(e.client_message()));
                    }
                }
                self.maybe_start_next();
            }
        }
    }

    fn finish(&mut self, id: &RunId, outcome: RunOutcome) {
        match &self.executing {
            Some(executing) if &executing.id == id => self.executing = None,
            _ => {
                warn!(run_id = %id, "Finished run was not the executing run");
                return;
            }
        }
        self.conclude(id, outcome);
        self.maybe_start_next();
    }

    /// Reports the terminal event for `id` and drops it from the ledger.
    fn conclude(&mut self, id: &RunId, outcome: RunOutcome) {
        let Some(mut run) = self.runs.remove(id) else {
            return;
        };
        run.state = match &outcome {
            RunOutcome::Completed(_) => RunState::Completed,
            RunOutcome::Failed(_) => RunState::Failed,
            RunOutcome::Cancelled => RunState::Cancelled,
        };
        let elapsed_ms = (Utc::now() - run.created_at).num_milliseconds();
        info!(run_id = %id, state = %run.state, elapsed_ms, "Run concluded");
        self.emit(id, run.owner, outcome.into());
    }

    fn cancel(&mut self, id: &RunId, requester: Option<ClientId>) -> CancelOutcome {
        let Some(run) = self.runs.get(id) else {
            debug!(run_id = %id, "Stop for unknown run ignored");
            return CancelOutcome::NotFound;
        };
        let (owner, state) = (run.owner, run.state);
        if requester.is_some_and(|client| client != owner) {
            warn!(run_id = %id, "Stop from a client that does not own the run ignored");
            return CancelOutcome::NotOwner;
        }

        match state {
            RunState::Queued => {
                self.queue.retain(|queued| queued != id);
                self.conclude(id, RunOutcome::Cancelled);
                CancelOutcome::Dequeued
            }
            RunState::Executing => {
                if let Some(executing) = &self.executing {
                    debug!(run_id = %id, "Signalling executing run to stop");
                    executing.token.cancel();
                }
                CancelOutcome::Signalled
            }
            RunState::Completed | RunState::Failed | RunState::Cancelled => {
                CancelOutcome::NotFound
            }
        }
    }

    fn release_client(&mut self, client: ClientId) -> usize {
        let owned: Vec<RunId> = self
            .runs
            .iter()
            .filter(|(_, run)| run.owner == client)
            .map(|(id, _)| id.clone())
            .collect();

        let released = owned
            .iter()
            .filter(|id| self.cancel(id, Some(client)) != CancelOutcome::NotFound)
            .count();
        if released > 0 {
            info!(client_id = %client, released, "Released runs of departed client");
        }
        released
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            queued: self.queue.iter().cloned().collect(),
            executing: self.executing.as_ref().map(|e| e.id.clone()),
        }
    }

    /// Cancels everything and waits out the executing run. Commands that
    /// arrive meanwhile are still answered; new submissions are refused.
    async fn shutdown_all(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<LedgerCmd>,
        action_rx: &mut mpsc::UnboundedReceiver<LedgerAction>,
    ) {
        self.shutting_down = true;

        let queued: Vec<RunId> = self.queue.drain(..).collect();
        for id in &queued {
            self.conclude(id, RunOutcome::Cancelled);
        }

        let Some(token) = self.executing.as_ref().map(|e| e.token.clone()) else {
            return;
        };
        token.cancel();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.executing.is_some() {
            tokio::select! {
                biased;

                action = action_rx.recv() => match action {
                    Some(LedgerAction::Finished { id, outcome }) => self.finish(&id, outcome),
                    Some(LedgerAction::RuntimeReady(_)) => {}
                    None => break,
                },

                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd),

                () = tokio::time::sleep_until(deadline) => {
                    warn!("Executing run did not stop before shutdown");
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunLedgerHandle {
    tx: mpsc::Sender<LedgerCmd>,
}

impl RunLedgerHandle {
    /// Admits a run and returns its 0-based queue position.
    pub async fn submit(
        &self,
        id: RunId,
        code: String,
        owner: ClientId,
    ) -> Result<usize, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerCmd::Submit {
                id,
                code,
                owner,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CoordinatorError::ChannelClosed)?
    }

    /// `requester` of `None` bypasses the ownership check.
    pub async fn cancel(
        &self,
        id: RunId,
        requester: Option<ClientId>,
    ) -> Result<CancelOutcome, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerCmd::Cancel {
                id,
                requester,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    pub async fn release_client(&self, client: ClientId) -> Result<usize, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerCmd::ReleaseClient {
                client,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<LedgerSnapshot, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerCmd::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(LedgerCmd::Shutdown);
    }
}

pub struct LedgerService {
    pub handle: RunLedgerHandle,
    task: JoinHandle<()>,
}

impl LedgerService {
    pub fn spawn(
        supervisor: Arc<RuntimeSupervisor>,
        events: RunEventSender,
        config: &LedgerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        let ledger = RunLedger::new(supervisor, events, action_tx);
        let task = tokio::spawn(ledger.run(rx, action_rx));

        Self {
            handle: RunLedgerHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> RunLedgerHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}
