//! Deterministic, pure logic shared by the agent loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod actions;
pub mod apply;
pub mod budget;
pub mod content;
pub mod document;
pub mod render;
pub mod session;
