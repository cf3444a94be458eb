//! In-process interpreter for tests.
//!
//! Programs are line-oriented scripts:
//!
//! | statement      | effect                                             |
//! |----------------|----------------------------------------------------|
//! | `print <text>` | writes `text` to stdout                            |
//! | `eprint <text>`| writes `text` to stderr                            |
//! | `sleep <ms>`   | sleeps, waking early if cancelled                  |
//! | `busy <ms>`    | sleeps without observing cancellation              |
//! | `yield`        | yields to the scheduler                            |
//! | `wait <gate>`  | blocks until [`ScriptInterpreter::release`]`(gate)`|
//! | `raise <msg>`  | fails the run with `msg`                           |
//! | `return <val>` | completes the run with `val`                       |
//!
//! Blank lines and `#` comments are skipped. Cancellation is observed between
//! statements and while sleeping or waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::interpreter::{Interpreter, InterpreterError};
use crate::runtime::OutputSink;
use crate::types::StreamKind;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ScriptInterpreter {
    output: Mutex<Option<OutputSink>>,
    bootstrap_delay: Duration,
    bootstrap_failures: AtomicUsize,
    bootstrap_calls: AtomicUsize,
    installed: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bootstrap_delay(mut self, delay: Duration) -> Self {
        self.bootstrap_delay = delay;
        self
    }

    /// The next `failures` bootstrap attempts fail.
    #[must_use]
    pub fn with_bootstrap_failures(self, failures: usize) -> Self {
        self.bootstrap_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn bootstrap_calls(&self) -> usize {
        self.bootstrap_calls.load(Ordering::SeqCst)
    }

    pub fn installed_packages(&self) -> Vec<String> {
        lock(&self.installed).clone()
    }

    /// Highest number of `execute` calls ever in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Every program handed to `execute`, in call order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    /// Opens `gate` for one waiter. Releasing before anyone waits is remembered.
    pub fn release(&self, gate: &str) {
        self.gate(gate).notify_one();
    }

    fn gate(&self, name: &str) -> Arc<Notify> {
        lock(&self.gates)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn run_script(
        &self,
        code: &str,
        sink: &OutputSink,
        token: &CancellationToken,
    ) -> Result<Option<String>, InterpreterError> {
        for raw in code.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if token.is_cancelled() {
                return Err(InterpreterError::Cancelled);
            }

            let (statement, arg) = line.split_once(' ').unwrap_or((line, ""));
            match statement {
                "print" => sink.write(StreamKind::Stdout, arg),
                "eprint" => sink.write(StreamKind::Stderr, arg),
                "yield" => tokio::task::yield_now().await,
                "busy" => tokio::time::sleep(parse_duration(arg)?).await,
                "sleep" => {
                    let duration = parse_duration(arg)?;
                    tokio::select! {
                        () = token.cancelled() => return Err(InterpreterError::Cancelled),
                        () = tokio::time::sleep(duration) => {}
                    }
                }
                "wait" => {
                    let gate = self.gate(arg.trim());
                    tokio::select! {
                        () = token.cancelled() => return Err(InterpreterError::Cancelled),
                        () = gate.notified() => {}
                    }
                }
                "raise" => return Err(InterpreterError::Raised(arg.to_string())),
                "return" => return Ok(Some(arg.to_string())),
                other => {
                    return Err(InterpreterError::Raised(format!(
                        "SyntaxError: unknown statement '{other}'"
                    )));
                }
            }
        }
        Ok(None)
    }
}

fn parse_duration(arg: &str) -> Result<Duration, InterpreterError> {
    arg.trim()
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| InterpreterError::Raised(format!("ValueError: invalid duration '{arg}'")))
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Interpreter for ScriptInterpreter {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn bootstrap(
        &self,
        output: OutputSink,
        packages: &[String],
    ) -> Result<(), InterpreterError> {
        self.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
        if !self.bootstrap_delay.is_zero() {
            tokio::time::sleep(self.bootstrap_delay).await;
        }

        if self
            .bootstrap_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(InterpreterError::Bootstrap(
                "simulated bootstrap failure".to_string(),
            ));
        }

        output.write(StreamKind::Stdout, "script interpreter loaded");
        lock(&self.installed).extend(packages.iter().cloned());
        *lock(&self.output) = Some(output);
        Ok(())
    }

    async fn execute(
        &self,
        code: &str,
        token: CancellationToken,
    ) -> Result<Option<String>, InterpreterError> {
        let sink = lock(&self.output)
            .clone()
            .ok_or(InterpreterError::NotBootstrapped)?;

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.max_active.fetch_max(active, Ordering::SeqCst);
        lock(&self.executed).push(code.to_string());

        self.run_script(code, &sink, &token).await
    }
}
