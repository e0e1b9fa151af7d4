//! Stable exit codes for nbagent CLI commands.

/// Command succeeded: the loop stopped or exhausted its iteration caps.
pub const OK: i32 = 0;
/// Command failed: invalid config, integrity error or an unrecovered loop error.
pub const ERROR: i32 = 1;
/// The run was interrupted by SIGINT/SIGTERM after saving its state.
pub const INTERRUPTED: i32 = 130;
