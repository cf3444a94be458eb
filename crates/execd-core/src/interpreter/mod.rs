//! Seam between the coordinator and the interpreter runtime it drives.
//!
//! The runtime is long-lived, expensive to bootstrap and non-reentrant. The
//! coordinator guarantees that `execute` is never called concurrently and only
//! after a successful `bootstrap`.

mod process;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::runtime::OutputSink;

pub use process::ProcessInterpreter;

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("{0}")]
    Bootstrap(String),

    /// The submitted code raised. The message is reported verbatim to the caller.
    #[error("{0}")]
    Raised(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Interpreter used before bootstrap")]
    NotBootstrapped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Interpreter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One-time bootstrap. `output` is the process-wide stdout/stderr sink; the
    /// interpreter writes everything the running program prints into it.
    async fn bootstrap(&self, output: OutputSink, packages: &[String])
    -> Result<(), InterpreterError>;

    /// Per-run preparation such as loading packages the code imports.
    async fn prepare(&self, _code: &str) -> Result<(), InterpreterError> {
        Ok(())
    }

    /// Evaluates `code` and returns the value it produced, if any.
    ///
    /// `token` is advisory: implementations check it at their own yield points
    /// and return [`InterpreterError::Cancelled`] when they stop because of it.
    /// Code that never reaches a yield point runs to completion.
    async fn execute(
        &self,
        code: &str,
        token: CancellationToken,
    ) -> Result<Option<String>, InterpreterError>;
}
