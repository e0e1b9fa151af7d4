//! Side-effecting collaborators of the agent loop.

pub mod completion;
pub mod config;
pub mod interrupt;
pub mod kernel;
pub mod notebook_file;
pub mod prompt;
pub mod session_store;
