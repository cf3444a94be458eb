use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Interpreter, InterpreterError};
use crate::config::InterpreterConfig;
use crate::runtime::OutputSink;
use crate::types::StreamKind;

/// Runs each program in a fresh child process of a configured interpreter
/// binary (`python3 -u -c <code>` by default).
///
/// Cancellation is checked whenever the child produces a line of output or
/// while waiting for one; the child is killed at that point.
pub struct ProcessInterpreter {
    config: InterpreterConfig,
    output: OnceLock<OutputSink>,
}

impl ProcessInterpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config,
            output: OnceLock::new(),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn check_version(&self) -> Result<(), InterpreterError> {
        let output = self
            .command(&self.config.program)
            .args(&self.config.version_args)
            .output()
            .await
            .map_err(|e| {
                InterpreterError::Bootstrap(format!(
                    "Failed to start interpreter '{}': {e}",
                    self.config.program
                ))
            })?;

        if !output.status.success() {
            return Err(InterpreterError::Bootstrap(format!(
                "Interpreter '{}' exited with {} during version check",
                self.config.program, output.status
            )));
        }

        // Older Pythons print their version to stderr.
        let version = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        } else {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        };
        info!(program = %self.config.program, version = %version, "Interpreter available");
        Ok(())
    }

    async fn install_package(
        &self,
        install_command: &[String],
        package: &str,
    ) -> Result<(), InterpreterError> {
        let Some((program, args)) = install_command.split_first() else {
            return Err(InterpreterError::Bootstrap(
                "Install command is empty".to_string(),
            ));
        };

        debug!(package = %package, "Installing package");
        let output = self
            .command(program)
            .args(args)
            .arg(package)
            .output()
            .await
            .map_err(|e| {
                InterpreterError::Bootstrap(format!("Failed to install {package}: {e}"))
            })?;

        if output.status.success() {
            info!(package = %package, "Installed package");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(InterpreterError::Bootstrap(format!(
                "Failed to install {package}: {}",
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl Interpreter for ProcessInterpreter {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn bootstrap(
        &self,
        output: OutputSink,
        packages: &[String],
    ) -> Result<(), InterpreterError> {
        self.check_version().await?;

        if !packages.is_empty() {
            let install_command = self.config.install_command.as_deref().unwrap_or_default();
            for package in packages {
                self.install_package(install_command, package).await?;
            }
        }

        // A retried bootstrap hands over the same sink.
        let _ = self.output.set(output);
        Ok(())
    }

    async fn execute(
        &self,
        code: &str,
        token: CancellationToken,
    ) -> Result<Option<String>, InterpreterError> {
        let sink = self
            .output
            .get()
            .cloned()
            .ok_or(InterpreterError::NotBootstrapped)?;

        let mut child = self
            .command(&self.config.program)
            .args(&self.config.args)
            .arg(code)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut last_stderr: Option<String> = None;

        // `read_until` keeps partial lines in the buffer across cancelled polls,
        // so buffers are only cleared once a whole line has been taken.
        while stdout_open || stderr_open {
            tokio::select! {
                biased;

                () = token.cancelled() => {
                    return Err(terminate(&mut child).await);
                }

                read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                    read?;
                    match take_line(&mut stdout_buf) {
                        Some(line) => sink.write(StreamKind::Stdout, &line),
                        None => stdout_open = false,
                    }
                }

                read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                    read?;
                    match take_line(&mut stderr_buf) {
                        Some(line) => {
                            sink.write(StreamKind::Stderr, &line);
                            if !line.trim().is_empty() {
                                last_stderr = Some(line);
                            }
                        }
                        None => stderr_open = false,
                    }
                }
            }
        }

        let status = tokio::select! {
            biased;

            () = token.cancelled() => {
                return Err(terminate(&mut child).await);
            }
            status = child.wait() => status?,
        };

        if status.success() {
            Ok(None)
        } else {
            Err(InterpreterError::Raised(
                last_stderr.unwrap_or_else(|| format!("Process exited with {status}")),
            ))
        }
    }
}

/// Drains one line from `buf`, decoding invalid UTF-8 lossily. `None` at EOF.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    if buf.is_empty() {
        return None;
    }
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
    }
    if buf[..end].ends_with(b"\r") {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    Some(line)
}

async fn terminate(child: &mut Child) -> InterpreterError {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill cancelled interpreter process");
    }
    InterpreterError::Cancelled
}
