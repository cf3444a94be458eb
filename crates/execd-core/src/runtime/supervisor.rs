use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::RunOutcome;
use super::multiplexer::OutputMultiplexer;
use crate::config::InterpreterConfig;
use crate::error::CoordinatorError;
use crate::interpreter::{Interpreter, InterpreterError};
use crate::types::{ClientId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuntimeStatus {
    Uninitialized,
    Initializing,
    Ready,
}

/// How a successful [`RuntimeSupervisor::ensure_ready`] call got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The runtime was already ready; nobody else has been told about this call.
    AlreadyReady,
    /// The call waited on a bootstrap, which announced readiness to everyone
    /// watching [`RuntimeSupervisor::subscribe_status`].
    Bootstrapped,
}

type Bootstrap = Shared<BoxFuture<'static, Result<(), CoordinatorError>>>;

enum RuntimeState {
    Uninitialized,
    Initializing(Bootstrap),
    Ready,
}

impl RuntimeState {
    fn status(&self) -> RuntimeStatus {
        match self {
            Self::Uninitialized => RuntimeStatus::Uninitialized,
            Self::Initializing(_) => RuntimeStatus::Initializing,
            Self::Ready => RuntimeStatus::Ready,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub owner: ClientId,
    pub code: String,
}

/// Owns the single interpreter instance.
///
/// Bootstrap is lazy and single-flight: concurrent callers share one in-flight
/// bootstrap. Execution is exclusive; the output capture binding doubles as the
/// "one run at a time" slot, so a second concurrent `execute` is refused.
pub struct RuntimeSupervisor {
    interpreter: Arc<dyn Interpreter>,
    multiplexer: OutputMultiplexer,
    packages: Vec<String>,
    prelude: Option<String>,
    state: Arc<Mutex<RuntimeState>>,
    status_tx: Arc<watch::Sender<RuntimeStatus>>,
}

fn lock(state: &Mutex<RuntimeState>) -> MutexGuard<'_, RuntimeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuntimeSupervisor {
    pub fn new(
        interpreter: Arc<dyn Interpreter>,
        multiplexer: OutputMultiplexer,
        config: &InterpreterConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(RuntimeStatus::Uninitialized);
        Self {
            interpreter,
            multiplexer,
            packages: config.packages.clone(),
            prelude: config.prelude.clone(),
            state: Arc::new(Mutex::new(RuntimeState::Uninitialized)),
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        lock(&self.state).status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status_tx.subscribe()
    }

    pub fn multiplexer(&self) -> &OutputMultiplexer {
        &self.multiplexer
    }

    pub async fn ensure_ready(&self) -> Result<Readiness, CoordinatorError> {
        let bootstrap = {
            let mut state = lock(&self.state);
            match &*state {
                RuntimeState::Ready => return Ok(Readiness::AlreadyReady),
                RuntimeState::Initializing(bootstrap) => bootstrap.clone(),
                RuntimeState::Uninitialized => {
                    let bootstrap = self.start_bootstrap();
                    *state = RuntimeState::Initializing(bootstrap.clone());
                    self.status_tx.send_replace(RuntimeStatus::Initializing);
                    bootstrap
                }
            }
        };

        bootstrap.await.map(|()| Readiness::Bootstrapped)
    }

    fn start_bootstrap(&self) -> Bootstrap {
        let interpreter = self.interpreter.clone();
        let sink = self.multiplexer.sink();
        let packages = self.packages.clone();
        let state = self.state.clone();
        let status_tx = self.status_tx.clone();

        let task = tokio::spawn(async move {
            info!(
                interpreter = interpreter.name(),
                packages = packages.len(),
                "Bootstrapping interpreter runtime"
            );
            interpreter.bootstrap(sink, &packages).await
        });

        async move {
            let result = match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(CoordinatorError::Initialization {
                    message: e.to_string(),
                }),
                Err(e) => Err(CoordinatorError::Initialization {
                    message: format!("Bootstrap task failed: {e}"),
                }),
            };

            let (next, status) = match &result {
                Ok(()) => (RuntimeState::Ready, RuntimeStatus::Ready),
                Err(_) => (RuntimeState::Uninitialized, RuntimeStatus::Uninitialized),
            };
            *lock(&state) = next;
            status_tx.send_replace(status);

            match &result {
                Ok(()) => info!("Interpreter runtime ready"),
                Err(e) => warn!(error = %e, "Interpreter bootstrap failed"),
            }
            result
        }
        .boxed()
        .shared()
    }

    fn compose(&self, code: &str) -> String {
        match &self.prelude {
            Some(prelude) if !prelude.is_empty() => format!("{prelude}\n{code}"),
            _ => code.to_string(),
        }
    }

    /// Runs one program to completion, failure or cancellation.
    ///
    /// `Err` is reserved for precondition violations (runtime not ready,
    /// another run bound); the program's own failures come back as
    /// [`RunOutcome::Failed`].
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<RunOutcome, CoordinatorError> {
        if self.status() != RuntimeStatus::Ready {
            return Err(CoordinatorError::NotReady);
        }

        let capture = self
            .multiplexer
            .register(request.run_id.clone(), request.owner)?;

        if token.is_cancelled() {
            debug!(run_id = %request.run_id, "Run cancelled before evaluation");
            return Ok(RunOutcome::Cancelled);
        }

        let code = self.compose(&request.code);
        let result = match self.interpreter.prepare(&code).await {
            Ok(()) => self.interpreter.execute(&code, token).await,
            Err(e) => Err(e),
        };
        drop(capture);

        let outcome = match result {
            Ok(output) => RunOutcome::Completed(output),
            Err(InterpreterError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed(CoordinatorError::from(e).client_message()),
        };
        debug!(run_id = %request.run_id, outcome = ?outcome, "Run finished");
        Ok(outcome)
    }
}
