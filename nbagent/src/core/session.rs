//! Durable agent session value.

use crate::core::document::Document;

/// Everything the loop needs to resume a task: the live document, the
/// append-only trajectory (one snapshot per inner iteration) and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSession {
    pub task: String,
    pub task_id: String,
    /// Latest critique feedback (or the feedback given at start-up).
    pub feedback: String,
    pub document: Document,
    pub trajectory: Vec<Document>,
    pub total_iterations: u32,
}

impl AgentSession {
    pub fn new(task: impl Into<String>, task_id: impl Into<String>, document: Document) -> Self {
        Self {
            task: task.into(),
            task_id: task_id.into(),
            feedback: String::new(),
            document,
            trajectory: Vec::new(),
            total_iterations: 0,
        }
    }

    /// Record the current document as the snapshot for a new inner iteration.
    ///
    /// Returns the 1-indexed iteration number.
    pub fn record_iteration(&mut self) -> u32 {
        self.trajectory.push(self.document.clone());
        self.total_iterations += 1;
        self.total_iterations
    }

    /// The goal text driving generation: the task, plus feedback when present.
    pub fn goal(&self) -> String {
        combine_task_with_feedback(&self.task, &self.feedback)
    }
}

/// Fold critique feedback into the original task statement.
pub fn combine_task_with_feedback(task: &str, feedback: &str) -> String {
    let feedback = feedback.trim();
    if feedback.is_empty() {
        return task.to_string();
    }
    format!("{task}\n(feedback: {feedback})\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::Cell;

    #[test]
    fn record_iteration_snapshots_by_value() {
        let mut session = AgentSession::new("t", "id", Document::new());
        assert_eq!(session.record_iteration(), 1);
        session.document = Document::from_cells(vec![Cell::code("x = 1")]);
        assert_eq!(session.record_iteration(), 2);

        assert!(session.trajectory[0].is_empty());
        assert_eq!(session.trajectory[1].len(), 1);
        assert_eq!(session.trajectory.len() as u32, session.total_iterations);
    }

    #[test]
    fn goal_is_not_cumulative() {
        let mut session = AgentSession::new("plot sleep", "id", Document::new());
        assert_eq!(session.goal(), "plot sleep");
        session.feedback = "add labels".to_string();
        assert_eq!(session.goal(), "plot sleep\n(feedback: add labels)\n");
        session.feedback = "use weeks".to_string();
        assert_eq!(session.goal(), "plot sleep\n(feedback: use weeks)\n");
    }
}
