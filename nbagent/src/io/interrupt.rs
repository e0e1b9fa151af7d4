//! Cooperative cancellation driven by SIGINT/SIGTERM.
//!
//! The signal thread only flips a shared flag; the agent loop polls it at
//! iteration boundaries and unwinds through its save path. A second signal
//! exits immediately.

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;
use tracing::warn;

use crate::exit_codes;

/// Raised by the loop when the interrupt token is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the token has been triggered.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_set() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// Keeps the signal thread alive; dropping it stops listening.
pub struct SignalGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Route SIGINT/SIGTERM into `token`.
pub fn install_signal_handlers(token: InterruptToken) -> Result<SignalGuard> {
    let mut signals =
        Signals::new([libc::SIGINT, libc::SIGTERM]).context("register signal handlers")?;
    let handle = signals.handle();

    let thread = thread::spawn(move || {
        for signal in signals.forever() {
            if token.is_set() {
                warn!(signal, "second interrupt, exiting");
                process::exit(exit_codes::INTERRUPTED);
            }
            warn!(signal, "interrupt received, stopping after the current step");
            token.trigger();
        }
    });

    Ok(SignalGuard {
        handle,
        thread: Some(thread),
    })
}
