//! Session creation: seed a fresh notebook or resume a saved one.

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::document::{Cell, CellKind, Document, Output, Position};
use crate::core::session::AgentSession;
use crate::io::kernel::ExecutionEngine;
use crate::io::session_store::SessionStore;

/// Start-up parameters for a solve run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub task: Option<String>,
    pub task_id: Option<String>,
    pub feedback: Option<String>,
    /// Code executed once when the notebook is seeded, then frozen.
    pub setup_code: Option<String>,
}

/// Default task id: UTC start time, e.g. `2024-05-01_09-30-00`.
pub fn default_task_id() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Build the starting notebook for a task.
///
/// The task becomes a markdown cell. Setup code, when given, is executed once
/// and must not raise; it is then flagged `skip_execution` so later runs keep
/// its outputs without re-running it.
pub fn seed_document<E: ExecutionEngine>(
    task: &str,
    setup_code: Option<&str>,
    engine: &mut E,
) -> Result<Document> {
    let mut doc = Document::from_cells(vec![Cell::markdown(task)]);
    let Some(code) = setup_code.filter(|code| !code.trim().is_empty()) else {
        return Ok(doc);
    };

    let setup_idx = doc.add_cell(code, CellKind::Code, Position::End)?;
    doc = engine.execute(&doc);
    let error = doc
        .cell(setup_idx)
        .and_then(|cell| cell.outputs.iter().find(|output| output.is_error()));
    if let Some(Output::Error { ename, evalue, .. }) = error {
        bail!("setup failed: {ename}: {evalue}");
    }
    doc.skip_execution(setup_idx)?;
    Ok(doc)
}

/// Resume the session saved under the requested task id, or seed a new one.
#[instrument(skip_all)]
pub fn open_session<E: ExecutionEngine>(
    store: &SessionStore,
    engine: &mut E,
    request: &SessionRequest,
) -> Result<AgentSession> {
    let task_id = request.task_id.clone().unwrap_or_else(default_task_id);

    if let Some(mut session) = store.load(&task_id)? {
        if let Some(task) = request.task.as_deref()
            && task != session.task
        {
            warn!(task_id = %task_id, "ignoring --task; resuming the saved task");
        }
        if let Some(feedback) = &request.feedback {
            session.feedback = feedback.clone();
        }
        info!(
            task_id = %task_id,
            total_iterations = session.total_iterations,
            "resuming session"
        );
        return Ok(session);
    }

    let Some(task) = request.task.as_deref() else {
        bail!("no saved session for task id {task_id:?}; a task is required to start one");
    };
    let document = seed_document(task, request.setup_code.as_deref(), engine)?;
    let mut session = AgentSession::new(task, task_id, document);
    session.feedback = request.feedback.clone().unwrap_or_default();
    info!(task_id = %session.task_id, "created session");
    Ok(session)
}
