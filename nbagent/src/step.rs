//! Orchestration for a single inner iteration and a single critique.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::actions::{CritiqueDecision, parse_actions, parse_critique};
use crate::core::apply::apply_mutations;
use crate::core::content::blocks_to_text;
use crate::core::render::{RenderOptions, render_document};
use crate::core::session::AgentSession;
use crate::io::completion::{CompletionBackend, CompletionRequest, content_hash};
use crate::io::config::AgentConfig;
use crate::io::interrupt::InterruptToken;
use crate::io::kernel::ExecutionEngine;
use crate::io::prompt::{Character, PromptBuilder};
use crate::io::session_store::SessionStore;

/// Everything the loop needs besides its two external collaborators.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub config: AgentConfig,
    pub prompts: PromptBuilder,
    pub store: SessionStore,
    pub interrupt: InterruptToken,
}

impl AgentContext {
    pub fn new(config: AgentConfig, prompts: PromptBuilder, interrupt: InterruptToken) -> Self {
        let store = SessionStore::new(config.agent.artifact_dir.clone());
        Self {
            config,
            prompts,
            store,
            interrupt,
        }
    }

    /// Build from config, loading the API guide addendum if configured.
    pub fn from_config(config: AgentConfig, interrupt: InterruptToken) -> Result<Self> {
        let prompts = PromptBuilder::from_guide(config.prompt.guide_path.as_deref())?;
        Ok(Self::new(config, prompts, interrupt))
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            include_outputs: true,
            max_output_chars: self.config.agent.max_cell_output_chars,
        }
    }
}

/// Result of a single inner iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Global iteration number (1-indexed, continues across resumes).
    pub iter: u32,
    /// The reply contained a stop block.
    pub stop: bool,
    pub applied: usize,
    pub skipped: usize,
    /// Hash of the rendered state the model was shown.
    pub fingerprint: String,
}

/// Execute one inner iteration: execute, snapshot + save, render, prompt,
/// complete, parse, apply.
///
/// The interrupt token is checked before execution and again once the
/// executed state is saved.
///
/// Edits from the reply are applied before the stop flag is reported.
#[instrument(skip_all, fields(task_id = %session.task_id))]
pub fn run_step<B: CompletionBackend, E: ExecutionEngine>(
    ctx: &AgentContext,
    backend: &B,
    engine: &mut E,
    session: &mut AgentSession,
) -> Result<StepOutcome> {
    ctx.interrupt.check()?;

    session.document = engine.execute(&session.document);
    let iter = session.record_iteration();
    ctx.store
        .save(session)
        .with_context(|| format!("save session at iteration {iter}"))?;
    // A signal during execution stops here, before the completion call.
    ctx.interrupt.check()?;

    let rendered = render_document(&session.document, &ctx.render_options());
    let fingerprint = content_hash(&blocks_to_text(&rendered));
    let messages = ctx
        .prompts
        .forward(&session.goal(), &rendered, Character::Generate)?;
    let reply = backend
        .complete(&CompletionRequest::new(messages, &ctx.config.llm))
        .with_context(|| format!("generate completion at iteration {iter}"))?;

    let actions = parse_actions(&reply);
    if actions.mutations.is_empty() {
        debug!(iter, reply_chars = reply.len(), "reply contained no well-formed actions");
    }
    let summary = apply_mutations(&mut session.document, &actions);
    for (mutation, err) in &summary.skipped {
        warn!(iter, ?mutation, err = %err, "skipped out-of-range mutation");
    }

    info!(
        iter,
        applied = summary.applied,
        skipped = summary.skipped.len(),
        stop = actions.stop,
        cells = session.document.len(),
        "step complete"
    );
    Ok(StepOutcome {
        iter,
        stop: actions.stop,
        applied: summary.applied,
        skipped: summary.skipped.len(),
        fingerprint,
    })
}

/// Ask the model to judge the document against the original task.
#[instrument(skip_all, fields(task_id = %session.task_id))]
pub fn run_critique<B: CompletionBackend>(
    ctx: &AgentContext,
    backend: &B,
    session: &AgentSession,
) -> Result<CritiqueDecision> {
    let rendered = render_document(&session.document, &ctx.render_options());
    let messages = ctx
        .prompts
        .forward(&session.task, &rendered, Character::Critique)?;
    let reply = backend
        .complete(&CompletionRequest::new(messages, &ctx.config.llm))
        .context("critique completion")?;
    let decision = parse_critique(&reply);
    info!(
        stop = decision.stop,
        has_feedback = decision.feedback.is_some(),
        "critique received"
    );
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::{Cell, CellKind, Document};
    use crate::core::content::Role;
    use crate::io::interrupt::Interrupted;
    use crate::test_support::{ScriptedBackend, ScriptedEngine, TestWorkspace};

    fn session() -> AgentSession {
        AgentSession::new(
            "count to three",
            "step-test",
            Document::from_cells(vec![Cell::markdown("count to three")]),
        )
    }

    #[test]
    fn step_executes_snapshots_and_applies_edits() {
        let workspace = TestWorkspace::new().expect("workspace");
        let ctx = workspace.context();
        let backend = ScriptedBackend::new(vec![
            "<add_cell><type>code</type><idx>append</idx><content>print(1)</content></add_cell>",
        ]);
        let mut engine = ScriptedEngine::default();
        let mut session = session();

        let outcome = run_step(&ctx, &backend, &mut engine, &mut session).expect("step");

        assert_eq!(outcome.iter, 1);
        assert!(!outcome.stop);
        assert_eq!(outcome.applied, 1);
        assert_eq!(engine.executions(), 1);
        // The snapshot is taken before the edit lands.
        assert_eq!(session.trajectory[0].len(), 1);
        assert_eq!(session.document.len(), 2);
        assert_eq!(session.document.cells()[1].kind, CellKind::Code);
        assert!(ctx.store.snapshot_path("step-test", 0).exists());
    }

    #[test]
    fn step_sends_goal_with_feedback() {
        let workspace = TestWorkspace::new().expect("workspace");
        let ctx = workspace.context();
        let backend = ScriptedBackend::new(vec!["<stop></stop>"]);
        let mut engine = ScriptedEngine::default();
        let mut session = session();
        session.feedback = "use a loop".to_string();

        let outcome = run_step(&ctx, &backend, &mut engine, &mut session).expect("step");
        assert!(outcome.stop);

        let requests = backend.requests();
        let user = &requests[0].messages[1];
        assert_eq!(user.role, Role::User);
        let task_block = user.content[0].as_text().expect("text");
        assert!(task_block.contains("count to three\n(feedback: use a loop)"));
    }

    #[test]
    fn interrupted_step_does_nothing() {
        let workspace = TestWorkspace::new().expect("workspace");
        let ctx = workspace.context();
        ctx.interrupt.trigger();
        let backend = ScriptedBackend::new(Vec::<&str>::new());
        let mut engine = ScriptedEngine::default();
        let mut session = session();

        let err = run_step(&ctx, &backend, &mut engine, &mut session).expect_err("interrupted");
        assert!(err.downcast_ref::<Interrupted>().is_some());
        assert_eq!(engine.executions(), 0);
        assert_eq!(session.total_iterations, 0);
    }

    /// Engine that fires the interrupt while "executing".
    struct SignalDuringExecution {
        interrupt: InterruptToken,
    }

    impl ExecutionEngine for SignalDuringExecution {
        fn execute(&mut self, doc: &Document) -> Document {
            self.interrupt.trigger();
            doc.clone()
        }
    }

    #[test]
    fn interrupt_during_execution_skips_completion() {
        let workspace = TestWorkspace::new().expect("workspace");
        let ctx = workspace.context();
        let backend = ScriptedBackend::new(vec![
            "<add_cell><type>code</type><idx>append</idx><content>print(1)</content></add_cell>",
        ]);
        let mut engine = SignalDuringExecution {
            interrupt: ctx.interrupt.clone(),
        };
        let mut session = session();

        let err = run_step(&ctx, &backend, &mut engine, &mut session).expect_err("interrupted");
        assert!(err.downcast_ref::<Interrupted>().is_some());
        assert_eq!(backend.calls(), 0);
        assert_eq!(session.document.len(), 1);
        assert_eq!(session.total_iterations, 1);
        let saved = ctx.store.load("step-test").expect("load").expect("saved");
        assert_eq!(saved.total_iterations, 1);
    }

    #[test]
    fn critique_uses_original_task() {
        let workspace = TestWorkspace::new().expect("workspace");
        let ctx = workspace.context();
        let backend = ScriptedBackend::new(vec!["<feedback>print the total</feedback>"]);
        let mut session = session();
        session.feedback = "earlier feedback".to_string();

        let decision = run_critique(&ctx, &backend, &session).expect("critique");
        assert!(!decision.stop);
        assert_eq!(decision.feedback.as_deref(), Some("print the total"));

        let requests = backend.requests();
        let task_block = requests[0].messages[1].content[0].as_text().expect("text");
        assert!(!task_block.contains("earlier feedback"));
    }
}
