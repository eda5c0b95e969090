//! Critical-section ownership.
//!
//! The request queue and the current holder live together in one
//! [`Arbiter`], which the coordinator only touches under a single lock. The
//! "busy" flag is `holder.is_some()`, so enqueue, pop-min and the busy
//! read-modify-write can never interleave.

use std::fmt;
use std::time::{Duration, Instant};

use super::queue::{PendingRequest, RequestQueue};
use super::registry::ConnectionId;

/// The node currently allowed inside the critical section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub pid: u32,
    pub conn: ConnectionId,
    /// Coordinator timestamp stamped on the GRANT.
    pub grant_clock: u64,
    pub granted_at: Instant,
}

/// Decides when an outstanding grant is considered abandoned.
pub trait GrantExpiry: Send + Sync + fmt::Debug {
    /// Whether `holder` should lose the critical section at `now`.
    fn is_expired(&self, holder: &Holder, now: Instant) -> bool;

    /// Lease length, if grants expire at all.
    fn lease(&self) -> Option<Duration> {
        None
    }
}

/// Grants never expire. A holder that dies inside the critical section
/// stalls every other node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExpire;

impl GrantExpiry for NeverExpire {
    fn is_expired(&self, _holder: &Holder, _now: Instant) -> bool {
        false
    }
}

/// Grants expire a fixed duration after they were issued.
#[derive(Debug, Clone, Copy)]
pub struct BoundedLease(pub Duration);

impl GrantExpiry for BoundedLease {
    fn is_expired(&self, holder: &Holder, now: Instant) -> bool {
        now.saturating_duration_since(holder.granted_at) >= self.0
    }

    fn lease(&self) -> Option<Duration> {
        Some(self.0)
    }
}

/// Queue plus holder.
#[derive(Debug, Default)]
pub struct Arbiter {
    pub queue: RequestQueue,
    pub holder: Option<Holder>,
}

impl Arbiter {
    pub fn new() -> Self {
        Arbiter::default()
    }

    pub fn is_busy(&self) -> bool {
        self.holder.is_some()
    }

    pub fn enqueue(&mut self, request: PendingRequest) {
        self.queue.push(request);
    }

    /// Pop the next request if the section is free.
    pub fn next_candidate(&mut self) -> Option<PendingRequest> {
        if self.is_busy() {
            return None;
        }
        self.queue.pop_min()
    }

    /// Clear the holder if it is `pid`. Returns whether it was.
    pub fn release(&mut self, pid: u32) -> bool {
        match &self.holder {
            Some(h) if h.pid == pid => {
                self.holder = None;
                true
            }
            _ => false,
        }
    }

    /// Clear the holder if `expiry` says its grant is stale.
    pub fn expire(&mut self, expiry: &dyn GrantExpiry, now: Instant) -> Option<Holder> {
        let expired = self
            .holder
            .as_ref()
            .map(|h| expiry.is_expired(h, now))
            .unwrap_or(false);
        if expired {
            self.holder.take()
        } else {
            None
        }
    }
}
