use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::interpreter::Interpreter;
use crate::runtime::{
    LedgerService, OutputMultiplexer, RunEventStream, RunLedgerHandle, RuntimeSupervisor,
};

/// The assembled execution core: one supervisor around one interpreter, and
/// the ledger that feeds it.
///
/// Every [`crate::runtime::RunEvent`] the core produces, whether lifecycle or
/// log output, arrives in order on the stream returned from [`Coordinator::spawn`].
pub struct Coordinator {
    supervisor: Arc<RuntimeSupervisor>,
    ledger: LedgerService,
}

impl Coordinator {
    pub fn spawn(
        interpreter: Arc<dyn Interpreter>,
        config: &CoordinatorConfig,
    ) -> (Self, RunEventStream) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let multiplexer = OutputMultiplexer::new(events_tx.clone());
        let supervisor = Arc::new(RuntimeSupervisor::new(
            interpreter.clone(),
            multiplexer,
            &config.interpreter,
        ));
        let ledger = LedgerService::spawn(supervisor.clone(), events_tx, &config.ledger);

        info!(interpreter = interpreter.name(), "Coordinator started");
        (Self { supervisor, ledger }, events_rx)
    }

    pub fn supervisor(&self) -> Arc<RuntimeSupervisor> {
        self.supervisor.clone()
    }

    pub fn ledger(&self) -> RunLedgerHandle {
        self.ledger.handle()
    }

    /// Cancels everything outstanding and waits for the ledger to stop.
    pub async fn shutdown(self) {
        self.ledger.shutdown().await;
        info!("Coordinator stopped");
    }
}
