//! Execution core: the run ledger, the runtime supervisor and the output
//! multiplexer that connects the two.

mod event;
mod ledger;
mod multiplexer;
mod supervisor;

pub use event::{RunEvent, RunEventKind, RunEventSender, RunEventStream, RunOutcome};
pub use ledger::{CancelOutcome, LedgerService, LedgerSnapshot, RunLedgerHandle};
pub use multiplexer::{CaptureGuard, OutputMultiplexer, OutputSink};
pub use supervisor::{ExecutionRequest, Readiness, RuntimeStatus, RuntimeSupervisor};
