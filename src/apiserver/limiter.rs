//! Server-wide login admission.
//!
//! Logins are expensive (password hashing, store reads), so at most
//! `capacity` run at once. Further logins wait for a permit.

use crate::core::error::{KeelError, KeelResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Default number of concurrent logins.
pub const DEFAULT_LOGIN_RATE_LIMIT: usize = 10;

/// Bounds the number of logins in flight.
#[derive(Debug)]
pub struct LoginLimiter {
    permits: Semaphore,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Held for the duration of one login.
#[derive(Debug)]
pub struct LoginPermit<'a> {
    limiter: &'a LoginLimiter,
    _permit: SemaphorePermit<'a>,
}

impl Drop for LoginPermit<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for LoginLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_RATE_LIMIT)
    }
}

impl LoginLimiter {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Wait for a login slot.
    pub async fn acquire(&self) -> KeelResult<LoginPermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| KeelError::ShuttingDown)?;
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(LoginPermit {
            limiter: self,
            _permit: permit,
        })
    }

    /// Refuse further logins. Waiters fail with `ShuttingDown`.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of logins seen in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}
