use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::event::{RunEvent, RunEventKind, RunEventSender};
use crate::error::CoordinatorError;
use crate::types::{ClientId, LogLine, RunId, StreamKind};

#[derive(Debug, Clone)]
struct Binding {
    run_id: RunId,
    owner: ClientId,
}

#[derive(Debug)]
struct Shared {
    binding: Mutex<Option<Binding>>,
    events: RunEventSender,
}

impl Shared {
    fn binding(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes the runtime's single stdout/stderr stream to whichever run is
/// currently bound.
///
/// At most one run is bound at a time. A binding is held by a
/// [`CaptureGuard`] and released when the guard is dropped, so every exit
/// path out of an execution deregisters exactly once.
#[derive(Debug, Clone)]
pub struct OutputMultiplexer {
    shared: Arc<Shared>,
}

impl OutputMultiplexer {
    pub fn new(events: RunEventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                binding: Mutex::new(None),
                events,
            }),
        }
    }

    /// Writer handed to the interpreter at bootstrap.
    pub fn sink(&self) -> OutputSink {
        OutputSink {
            shared: self.shared.clone(),
        }
    }

    pub fn register(
        &self,
        run_id: RunId,
        owner: ClientId,
    ) -> Result<CaptureGuard, CoordinatorError> {
        let mut binding = self.shared.binding();
        if let Some(active) = binding.as_ref() {
            return Err(if active.run_id == run_id {
                CoordinatorError::AlreadyRegistered { id: run_id }
            } else {
                CoordinatorError::Busy {
                    id: active.run_id.clone(),
                }
            });
        }

        *binding = Some(Binding {
            run_id: run_id.clone(),
            owner,
        });
        debug!(run_id = %run_id, "Output capture registered");

        Ok(CaptureGuard {
            shared: self.shared.clone(),
            run_id,
        })
    }

    pub fn active(&self) -> Option<RunId> {
        self.shared.binding().as_ref().map(|b| b.run_id.clone())
    }
}

/// Clonable handle the runtime writes its output through.
#[derive(Debug, Clone)]
pub struct OutputSink {
    shared: Arc<Shared>,
}

impl OutputSink {
    /// Emits one log line per line of `text` for the bound run. Output with no
    /// bound run (for example during bootstrap) is only traced.
    pub fn write(&self, kind: StreamKind, text: &str) {
        // Sent while holding the lock so no line can slip past deregistration.
        let binding = self.shared.binding();
        let Some(binding) = binding.as_ref() else {
            trace!(stream = %kind, text = %text, "Discarding unbound runtime output");
            return;
        };

        let emit = |line: &str| {
            let event = RunEvent {
                run_id: binding.run_id.clone(),
                owner: binding.owner,
                kind: RunEventKind::Log(LogLine::new(kind, line)),
            };
            if self.shared.events.send(event).is_err() {
                trace!(run_id = %binding.run_id, "Run event receiver dropped");
            }
        };

        if text.is_empty() {
            emit("");
        } else {
            for line in text.lines() {
                emit(line);
            }
        }
    }
}

/// Scoped registration returned by [`OutputMultiplexer::register`].
#[derive(Debug)]
pub struct CaptureGuard {
    shared: Arc<Shared>,
    run_id: RunId,
}

impl CaptureGuard {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let mut binding = self.shared.binding();
        if binding
            .as_ref()
            .is_some_and(|active| active.run_id == self.run_id)
        {
            *binding = None;
            debug!(run_id = %self.run_id, "Output capture deregistered");
        }
    }
}
