//! Execution engine abstraction and the python kernel implementation.
//!
//! The [`ExecutionEngine`] trait decouples the agent loop from the
//! interpreter. Tests use scripted engines that fill outputs without spawning
//! processes.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::remaining_budget;
use crate::core::document::{CellKind, Document, Output};
use crate::io::config::KernelConfig;

const DRIVER: &str = include_str!("kernel_driver.py");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Runs every code cell of a document, in order, in one shared namespace.
pub trait ExecutionEngine {
    /// Execute the document and return the executed copy.
    ///
    /// Never fails: on internal failure (spawn error, timeout, protocol error)
    /// the input document is returned unchanged. Cells flagged
    /// `skip_execution` keep their outputs. Execution stops at the first cell
    /// that raises; later code cells get empty outputs.
    fn execute(&mut self, doc: &Document) -> Document;
}

#[derive(Debug, Serialize)]
struct CellRequest<'a> {
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct CellReply {
    outputs: Vec<Output>,
}

#[derive(Debug, Deserialize)]
struct ReadyReply {
    ready: bool,
}

/// Persistent `python` subprocess driven over a JSON-lines protocol.
///
/// The process is started lazily and restarted after any failure, which also
/// resets the interpreter namespace.
pub struct PythonKernel {
    python: String,
    timeout: Duration,
    process: Option<KernelProcess>,
}

impl PythonKernel {
    pub fn new(cfg: &KernelConfig) -> Self {
        Self {
            python: cfg.python.clone(),
            timeout: Duration::from_secs(cfg.execution_timeout_secs),
            process: None,
        }
    }

    fn try_execute(&mut self, doc: &Document) -> Result<Document> {
        let deadline = Instant::now() + self.timeout;
        let mut executed = doc.clone();
        let mut failed_at = None;

        for (idx, cell) in executed.cells_mut().iter_mut().enumerate() {
            if cell.kind != CellKind::Code || cell.skip_execution {
                continue;
            }
            if failed_at.is_some() {
                cell.outputs.clear();
                continue;
            }
            let budget = remaining_budget(deadline)?;
            let process = self.process(budget)?;
            cell.outputs = process.run_cell(&cell.source, budget)?;
            if cell.outputs.iter().any(Output::is_error) {
                debug!(cell = idx, "cell raised, skipping later cells");
                failed_at = Some(idx);
            }
        }

        info!(cells = executed.len(), failed_at = ?failed_at, "document executed");
        Ok(executed)
    }

    fn process(&mut self, budget: Duration) -> Result<&mut KernelProcess> {
        if self.process.is_none() {
            self.process = Some(KernelProcess::spawn(&self.python, budget)?);
        }
        self.process
            .as_mut()
            .ok_or_else(|| anyhow!("kernel process missing"))
    }

    fn restart(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown();
        }
    }
}

impl ExecutionEngine for PythonKernel {
    #[instrument(skip_all, fields(cells = doc.len(), timeout_secs = self.timeout.as_secs()))]
    fn execute(&mut self, doc: &Document) -> Document {
        match self.try_execute(doc) {
            Ok(executed) => executed,
            Err(err) => {
                warn!(err = %err, "execution failed, keeping previous document");
                self.restart();
                doc.clone()
            }
        }
    }
}

impl Drop for PythonKernel {
    fn drop(&mut self) {
        self.restart();
    }
}

struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
}

impl KernelProcess {
    fn spawn(python: &str, timeout: Duration) -> Result<Self> {
        debug!(python, "spawning kernel");
        let mut cmd = Command::new(python);
        cmd.arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn kernel {python}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut process = Self {
            child,
            stdin,
            lines: rx,
        };
        let ready: ReadyReply = serde_json::from_str(&process.read_line(timeout)?)
            .context("parse kernel handshake")?;
        if !ready.ready {
            process.shutdown();
            bail!("kernel did not report ready");
        }
        Ok(process)
    }

    fn run_cell(&mut self, code: &str, timeout: Duration) -> Result<Vec<Output>> {
        let mut line = serde_json::to_string(&CellRequest { code })?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .context("write cell to kernel")?;
        self.stdin.flush().context("flush kernel stdin")?;

        let reply: CellReply =
            serde_json::from_str(&self.read_line(timeout)?).context("parse kernel reply")?;
        Ok(reply.outputs)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => line.context("read kernel output"),
            Err(RecvTimeoutError::Timeout) => {
                Err(anyhow!("kernel timed out after {}s", timeout.as_secs()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("kernel exited unexpectedly")),
        }
    }

    /// Close stdin so the driver exits, then kill it if it lingers.
    fn shutdown(self) {
        let KernelProcess {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        match child.wait_timeout(SHUTDOWN_GRACE) {
            Ok(Some(status)) => debug!(exit_code = ?status.code(), "kernel exited"),
            _ => {
                warn!("kernel did not exit, killing");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
