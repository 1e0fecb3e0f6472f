//! Identifier generation.
//!
//! Global-scope ids (sessions, subscriptions, registrations, publications)
//! are random; request ids are sequential per session.

use junction_protocol::Id;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exclusive upper bound for random ids (2^53).
pub const MAX_ID: Id = 1 << 53;

/// Largest request id before the per-session counter wraps back to 1.
pub const MAX_REQUEST_ID: Id = 1 << 53;

/// Generate a random id in `[0, 2^53)`.
///
/// Collisions are not checked.
#[must_use]
pub fn new_id() -> Id {
    rand::thread_rng().gen_range(0..MAX_ID)
}

/// Sequential request id counter for one session.
///
/// Starts at 1, wraps to 1 after [`MAX_REQUEST_ID`] and never yields 0.
#[derive(Debug, Default)]
pub struct RequestIds {
    last: AtomicU64,
}

impl RequestIds {
    /// Create a counter whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter that continues after `last`.
    #[must_use]
    pub fn starting_after(last: Id) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Get the next request id.
    pub fn next_id(&self) -> Id {
        let step = |last: Id| if last >= MAX_REQUEST_ID { 1 } else { last + 1 };
        // The closure never returns None, so both arms carry the previous value.
        let previous = match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(step(last)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        step(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_id_range() {
        for _ in 0..1000 {
            assert!(new_id() < MAX_ID);
        }
    }

    #[test]
    fn test_new_ids_differ() {
        let ids: HashSet<Id> = (0..100).map(|_| new_id()).collect();
        // Collisions in 2^53 are possible but not for 100 draws in practice
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_request_ids_increment() {
        let ids = RequestIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_request_ids_wrap() {
        let ids = RequestIds::starting_after(MAX_REQUEST_ID - 1);
        assert_eq!(ids.next_id(), MAX_REQUEST_ID);
        assert_eq!(ids.next_id(), 1);

        let ids = RequestIds::starting_after(MAX_REQUEST_ID);
        assert_eq!(ids.next_id(), 1);
    }
}
