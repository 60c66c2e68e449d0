//! Reference ids for lock-style invocations.
//!
//! Every lock/unlock request carries a reference id so the member can tell a
//! retried request apart from a new one. Ids are strictly increasing and are
//! never reused; running out of ids is reported as
//! [`HzlinkError::IdentifierExhausted`] instead of wrapping.

use crate::error::{HzlinkError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Client-generated id attached to an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferenceId(pub u64);

impl ReferenceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide monotonic id source.
#[derive(Debug, Default)]
pub struct ReferenceIdGenerator {
    last_issued: AtomicU64,
}

impl ReferenceIdGenerator {
    /// Create a generator whose first id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a generator that continues after `last_issued`.
    pub fn starting_after(last_issued: u64) -> Self {
        Self {
            last_issued: AtomicU64::new(last_issued),
        }
    }

    /// Issue the next id.
    pub fn next(&self) -> Result<ReferenceId> {
        self.last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(1)
            })
            .map(|previous| ReferenceId(previous + 1))
            .map_err(|_| HzlinkError::IdentifierExhausted)
    }

    /// The most recently issued id, or 0 if none was issued yet.
    pub fn last_issued(&self) -> u64 {
        self.last_issued.load(Ordering::SeqCst)
    }
}
