//! Tenant grace timer
//!
//! There is at most one deadline per tenant: arming always replaces the
//! previous one.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Default time a tenant may go without any tunnel socket
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct GraceTimer {
    window: Duration,
    deadline: Option<Instant>,
}

impl GraceTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Cancel any pending deadline and start a fresh window
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the current deadline passes; never while disarmed
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
