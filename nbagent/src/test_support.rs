//! Test-only fakes for the two external collaborators, plus a scratch workspace.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::document::{CellKind, Document, Output};
use crate::io::completion::{CompletionBackend, CompletionRequest};
use crate::io::config::AgentConfig;
use crate::io::interrupt::InterruptToken;
use crate::io::kernel::ExecutionEngine;
use crate::io::prompt::PromptBuilder;
use crate::step::AgentContext;

/// Backend that replays canned replies in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new<S: Into<String>>(replies: Vec<S>) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted backend exhausted"))
    }
}

/// Engine that "runs" code cells without an interpreter.
///
/// Each executed code cell prints `ran: <source>`. A cell whose source
/// contains `raise` produces an error and stops execution, like the kernel.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    executions: usize,
}

impl ScriptedEngine {
    pub fn executions(&self) -> usize {
        self.executions
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn execute(&mut self, doc: &Document) -> Document {
        self.executions += 1;
        let mut executed = doc.clone();

        let mut failed = false;
        for cell in executed.cells_mut() {
            if cell.kind != CellKind::Code || cell.skip_execution {
                continue;
            }
            if failed {
                cell.outputs.clear();
                continue;
            }
            cell.outputs = vec![Output::stdout(format!("ran: {}\n", cell.source))];
            if cell.source.contains("raise") {
                cell.outputs.push(Output::Error {
                    ename: "RuntimeError".to_string(),
                    evalue: "scripted failure".to_string(),
                    traceback: Vec::new(),
                });
                failed = true;
            }
        }
        executed
    }
}

/// Temporary artifact directory with a matching config.
pub struct TestWorkspace {
    _temp: TempDir,
    config: AgentConfig,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let mut config = AgentConfig::default();
        config.agent.artifact_dir = temp.path().join("artifacts");
        config.llm.cache = false;
        config.llm.cache_dir = temp.path().join("llm_cache");
        Ok(Self {
            _temp: temp,
            config,
        })
    }

    pub fn config_mut(&mut self) -> &mut AgentConfig {
        &mut self.config
    }

    /// Fresh context over the current config with a clean interrupt token.
    pub fn context(&self) -> AgentContext {
        AgentContext::new(
            self.config.clone(),
            PromptBuilder::default(),
            InterruptToken::new(),
        )
    }
}
