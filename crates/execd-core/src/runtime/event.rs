use tokio::sync::mpsc;

use crate::types::{ClientId, LogLine, RunId};

/// Something that happened to a run, addressed to the client that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub run_id: RunId,
    pub owner: ClientId,
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEventKind {
    /// Admitted to the global queue with `position` runs ahead of it.
    Queued { position: usize },
    Started,
    Log(LogLine),
    Completed { output: Option<String> },
    Failed { message: String },
    Cancelled,
}

impl RunEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Final result of one pass through the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(Option<String>),
    Failed(String),
    Cancelled,
}

impl From<RunOutcome> for RunEventKind {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(output) => Self::Completed { output },
            RunOutcome::Failed(message) => Self::Failed { message },
            RunOutcome::Cancelled => Self::Cancelled,
        }
    }
}

pub type RunEventSender = mpsc::UnboundedSender<RunEvent>;

/// Every run event in production order. Consumed by the gateway.
pub type RunEventStream = mpsc::UnboundedReceiver<RunEvent>;
