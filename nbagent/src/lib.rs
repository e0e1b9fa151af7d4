//! Autonomous notebook agent.
//!
//! A language model edits a notebook one step at a time: the notebook is
//! executed, rendered into a prompt, and the model replies with tagged
//! actions (add, replace or delete cells, or stop). An outer loop asks the
//! model to critique the result and folds that feedback into the next goal.
//!
//! - **[`core`]**: Pure, deterministic logic (document model, action codec,
//!   rendering, session value). No I/O.
//! - **[`io`]**: Side effects (kernel process, completion backends, notebook
//!   files, session store, config, signals).
//!
//! Orchestration lives in [`step`] (one iteration), [`looping`] (inner and
//! outer loops) and [`seed`] (creating or resuming a session).

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod seed;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
