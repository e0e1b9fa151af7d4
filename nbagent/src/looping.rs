//! Inner solve loop and outer critique/refine loop.

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use crate::core::session::AgentSession;
use crate::io::completion::CompletionBackend;
use crate::io::interrupt::Interrupted;
use crate::io::kernel::ExecutionEngine;
use crate::step::{AgentContext, run_critique, run_step};

/// How one goal attempt (inner loop) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEnd {
    /// The model sent a stop block.
    Stopped,
    /// `max_iterations` steps ran without a stop block.
    IterationCap,
    /// The rendered state did not change for `repeats` consecutive steps.
    Stalled { repeats: u32 },
}

/// Reason why `solve` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Generation signalled stop.
    Stopped,
    /// The critique accepted the document.
    Accepted,
    /// `max_goal_iterations` attempts ran without either.
    Exhausted,
}

/// Summary of a `solve` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveOutcome {
    pub stop: LoopStop,
    /// Goal attempts made in this invocation.
    pub goal_iterations: u32,
    /// Inner iterations made in this invocation.
    pub steps_executed: u32,
    /// Inner iterations over the session's lifetime.
    pub total_iterations: u32,
}

/// The agent loop. Owns its collaborators; borrows the session it drives.
pub struct AgentLoop<B, E> {
    ctx: AgentContext,
    backend: B,
    engine: E,
}

impl<B: CompletionBackend, E: ExecutionEngine> AgentLoop<B, E> {
    pub fn new(ctx: AgentContext, backend: B, engine: E) -> Self {
        Self {
            ctx,
            backend,
            engine,
        }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run the outer loop to completion.
    ///
    /// The session is saved on every exit path. Errors (including
    /// [`Interrupted`]) are logged and returned after the save.
    #[instrument(skip_all, fields(task_id = %session.task_id))]
    pub fn solve(&mut self, session: &mut AgentSession) -> Result<SolveOutcome> {
        let started_at = session.total_iterations;
        let attempt = self.solve_goals(session, started_at);
        let saved = self.ctx.store.save(session);

        match attempt {
            Ok(outcome) => {
                saved?;
                info!(
                    stop = ?outcome.stop,
                    goal_iterations = outcome.goal_iterations,
                    total_iterations = outcome.total_iterations,
                    "solve finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                if err.downcast_ref::<Interrupted>().is_some() {
                    warn!(total_iterations = session.total_iterations, "solve interrupted");
                } else {
                    error!(err = %format!("{err:#}"), "solve failed");
                }
                if let Err(save_err) = saved {
                    error!(err = %format!("{save_err:#}"), "failed to save session after error");
                }
                Err(err)
            }
        }
    }

    fn solve_goals(&mut self, session: &mut AgentSession, started_at: u32) -> Result<SolveOutcome> {
        let max_goal_iterations = self.ctx.config.agent.max_goal_iterations;
        let mut stop = LoopStop::Exhausted;
        let mut goal_iterations = 0;

        for goal_iter in 1..=max_goal_iterations {
            goal_iterations = goal_iter;
            let end = self.run_goal_attempt(session, goal_iter)?;
            if end == AttemptEnd::Stopped {
                stop = LoopStop::Stopped;
                break;
            }

            self.ctx.interrupt.check()?;
            let decision = run_critique(&self.ctx, &self.backend, session)?;
            if decision.stop {
                stop = LoopStop::Accepted;
                break;
            }
            match decision.feedback {
                Some(feedback) => {
                    info!(goal_iter, feedback = %feedback, "updating goal with feedback");
                    session.feedback = feedback;
                }
                None => debug!(goal_iter, "critique gave no feedback, keeping goal"),
            }
        }

        // Run the final edits once so the saved document carries their outputs.
        self.ctx.interrupt.check()?;
        session.document = self.engine.execute(&session.document);

        Ok(SolveOutcome {
            stop,
            goal_iterations,
            steps_executed: session.total_iterations - started_at,
            total_iterations: session.total_iterations,
        })
    }

    /// Run the inner loop for the session's current goal.
    #[instrument(skip_all, fields(goal_iter = goal_iter))]
    pub fn run_goal_attempt(
        &mut self,
        session: &mut AgentSession,
        goal_iter: u32,
    ) -> Result<AttemptEnd> {
        let agent = &self.ctx.config.agent;
        info!(goal = %session.goal(), "starting goal attempt");

        let mut last_fingerprint: Option<String> = None;
        let mut repeats = 0u32;
        for _ in 0..agent.max_iterations {
            let step = run_step(&self.ctx, &self.backend, &mut self.engine, session)?;
            if step.stop {
                return Ok(AttemptEnd::Stopped);
            }

            if last_fingerprint.as_deref() == Some(step.fingerprint.as_str()) {
                repeats += 1;
            } else {
                repeats = 1;
                last_fingerprint = Some(step.fingerprint);
            }
            if agent.max_repeated_states > 0 && repeats >= agent.max_repeated_states {
                warn!(iter = step.iter, repeats, "state unchanged, ending goal attempt");
                return Ok(AttemptEnd::Stalled { repeats });
            }
        }
        debug!(max_iterations = agent.max_iterations, "iteration cap reached");
        Ok(AttemptEnd::IterationCap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::{Cell, Document};
    use crate::test_support::{ScriptedBackend, ScriptedEngine, TestWorkspace};

    const ADD_CELL: &str =
        "<add_cell><type>code</type><idx>append</idx><content>print('x')</content></add_cell>";

    fn session() -> AgentSession {
        AgentSession::new(
            "print x",
            "loop-test",
            Document::from_cells(vec![Cell::markdown("print x")]),
        )
    }

    fn agent_loop(
        workspace: &TestWorkspace,
        replies: Vec<&str>,
    ) -> AgentLoop<ScriptedBackend, ScriptedEngine> {
        AgentLoop::new(
            workspace.context(),
            ScriptedBackend::new(replies),
            ScriptedEngine::default(),
        )
    }

    #[test]
    fn stop_in_first_attempt_skips_critique() {
        let workspace = TestWorkspace::new().expect("workspace");
        let mut agent = agent_loop(&workspace, vec![ADD_CELL, "<stop></stop>"]);
        let mut session = session();

        let outcome = agent.solve(&mut session).expect("solve");
        assert_eq!(outcome.stop, LoopStop::Stopped);
        assert_eq!(outcome.goal_iterations, 1);
        assert_eq!(outcome.steps_executed, 2);
        assert_eq!(agent.backend().calls(), 2);
        // Two steps plus the final execution.
        assert_eq!(agent.engine().executions(), 3);
    }

    #[test]
    fn critique_feedback_drives_next_attempt() {
        let mut workspace = TestWorkspace::new().expect("workspace");
        workspace.config_mut().agent.max_iterations = 1;
        let mut agent = agent_loop(
            &workspace,
            vec![
                ADD_CELL,
                "<feedback>label the output</feedback>",
                "<stop></stop>",
            ],
        );
        let mut session = session();

        let outcome = agent.solve(&mut session).expect("solve");
        assert_eq!(outcome.stop, LoopStop::Stopped);
        assert_eq!(outcome.goal_iterations, 2);
        assert_eq!(session.feedback, "label the output");

        let requests = agent.backend().requests();
        let second_goal = requests[2].messages[1].content[0].as_text().expect("text");
        assert!(second_goal.contains("print x\n(feedback: label the output)\n"));
    }

    #[test]
    fn critique_stop_accepts_document() {
        let mut workspace = TestWorkspace::new().expect("workspace");
        workspace.config_mut().agent.max_iterations = 1;
        let mut agent = agent_loop(&workspace, vec![ADD_CELL, "<stop></stop>"]);
        let mut session = session();

        let outcome = agent.solve(&mut session).expect("solve");
        assert_eq!(outcome.stop, LoopStop::Accepted);
        assert_eq!(outcome.goal_iterations, 1);
    }

    #[test]
    fn exhausted_goals_still_succeed() {
        let mut workspace = TestWorkspace::new().expect("workspace");
        workspace.config_mut().agent.max_iterations = 1;
        workspace.config_mut().agent.max_goal_iterations = 2;
        let mut agent = agent_loop(
            &workspace,
            vec![ADD_CELL, "<feedback>more</feedback>", ADD_CELL, "no decision"],
        );
        let mut session = session();

        let outcome = agent.solve(&mut session).expect("solve");
        assert_eq!(outcome.stop, LoopStop::Exhausted);
        assert_eq!(outcome.goal_iterations, 2);
        assert_eq!(outcome.total_iterations, 2);
    }

    #[test]
    fn unchanged_state_ends_attempt() {
        let mut workspace = TestWorkspace::new().expect("workspace");
        workspace.config_mut().agent.max_iterations = 10;
        workspace.config_mut().agent.max_repeated_states = 3;
        let mut agent = agent_loop(&workspace, vec!["thinking...", "still thinking", "hmm"]);
        let mut session = session();

        let end = agent.run_goal_attempt(&mut session, 1).expect("attempt");
        assert_eq!(end, AttemptEnd::Stalled { repeats: 3 });
        assert_eq!(session.total_iterations, 3);
    }

    #[test]
    fn smallest_repeat_limit_allows_progress() {
        let mut workspace = TestWorkspace::new().expect("workspace");
        workspace.config_mut().agent.max_iterations = 3;
        workspace.config_mut().agent.max_repeated_states = 2;
        let mut agent = agent_loop(&workspace, vec![ADD_CELL, ADD_CELL, ADD_CELL]);
        let mut session = session();

        let end = agent.run_goal_attempt(&mut session, 1).expect("attempt");
        assert_eq!(end, AttemptEnd::IterationCap);
        assert_eq!(session.total_iterations, 3);
    }

    #[test]
    fn iteration_cap_ends_attempt() {
        let mut workspace = TestWorkspace::new().expect("workspace");
        workspace.config_mut().agent.max_iterations = 2;
        let mut agent = agent_loop(&workspace, vec![ADD_CELL, ADD_CELL]);
        let mut session = session();

        let end = agent.run_goal_attempt(&mut session, 1).expect("attempt");
        assert_eq!(end, AttemptEnd::IterationCap);
        assert_eq!(session.trajectory.len(), 2);
    }

    #[test]
    fn backend_failure_is_returned_after_saving() {
        let workspace = TestWorkspace::new().expect("workspace");
        let mut agent = agent_loop(&workspace, vec![ADD_CELL]);
        let mut session = session();

        let err = agent.solve(&mut session).expect_err("exhausted backend");
        assert!(format!("{err:#}").contains("scripted backend exhausted"));

        let saved = agent
            .context()
            .store
            .load("loop-test")
            .expect("load")
            .expect("saved");
        assert_eq!(saved.total_iterations, 2);
        assert_eq!(saved.document, session.document);
    }
}
