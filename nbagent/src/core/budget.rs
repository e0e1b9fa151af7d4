//! Shared time budget helpers for bounded document execution.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("execution timed out"));
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_is_an_error() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let err = remaining_budget(deadline).expect_err("timed out");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn future_deadline_leaves_budget() {
        let remaining =
            remaining_budget(Instant::now() + Duration::from_secs(60)).expect("budget");
        assert!(remaining > Duration::from_secs(50));
    }
}
