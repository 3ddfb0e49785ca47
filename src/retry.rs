//! Retry and backoff policy
//!
//! One backoff shape is shared by every retrying call site: upload attempts
//! inside the uploader and whole-session restarts in the session loop. Each
//! site holds its own [`Backoff`] value built from a [`RetryPolicy`], so the
//! delay state never leaks between unrelated operations.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Parameters for an exponential backoff sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,

    /// Ceiling for the doubling delay
    pub max_delay: Duration,

    /// Optional retry ceiling; `None` retries until cancelled
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Upload retry shape: 2s doubling to 30s, gated by cancellation only.
    pub const UPLOAD: RetryPolicy = RetryPolicy {
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        max_attempts: None,
    };

    /// Session restart shape: 5s doubling to 60s, gated by cancellation only.
    pub const SESSION: RetryPolicy = RetryPolicy {
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
        max_attempts: None,
    };

    /// Start a fresh backoff sequence under this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.base_delay,
            attempts: 0,
        }
    }
}

/// Mutable state of one backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Delay to wait before the next retry, or `None` when the policy's
    /// attempt ceiling is exhausted. The returned delay is the current value;
    /// the stored value doubles up to the policy ceiling.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.policy.max_delay);
        Some(delay)
    }

    /// Reset to the policy floor after a success.
    pub fn reset(&mut self) {
        self.current = self.policy.base_delay;
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Sleep for `delay`, returning `Err(Cancelled)` as soon as the token fires.
pub async fn wait_interruptible(token: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(AgentError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
