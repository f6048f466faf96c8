//! Keep-alive timeout queue.
//!
//! Entries are appended on renewal. Because the timeout is one per-Options
//! constant, append order is expiry order, so the sweep walks from the
//! front and stops at the first entry that has not expired.
//!
//! Renewal is remove-then-reinsert in effect: the authoritative deadline
//! lives in a map and superseded queue entries are dropped lazily when the
//! sweep reaches them, keeping renewal O(1).

use std::collections::{HashMap, VecDeque};

/// Insertion-ordered expiry queue keyed by connection id.
#[derive(Debug, Default)]
pub struct KeepAliveQueue {
    deadlines: HashMap<u64, u64>,
    queue: VecDeque<(u64, u64)>,
}

impl KeepAliveQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Renews `conn_id` to expire at `expires_at`.
    pub fn renew(&mut self, conn_id: u64, expires_at: u64) {
        self.deadlines.insert(conn_id, expires_at);
        self.queue.push_back((conn_id, expires_at));
    }

    /// Clears the timer for `conn_id`. Returns true if one was armed.
    pub fn remove(&mut self, conn_id: u64) -> bool {
        self.deadlines.remove(&conn_id).is_some()
    }

    /// True when a timer is armed for `conn_id`.
    #[must_use]
    pub fn contains(&self, conn_id: u64) -> bool {
        self.deadlines.contains_key(&conn_id)
    }

    /// The armed deadline for `conn_id`, if any.
    #[must_use]
    pub fn deadline(&self, conn_id: u64) -> Option<u64> {
        self.deadlines.get(&conn_id).copied()
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// True when no timers are armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Pops every connection whose deadline is at or before `now`.
    ///
    /// Expired connections have their timers cleared; callers decide
    /// whether to close or spare them. Walks in insertion order and
    /// short-circuits on the first live deadline.
    pub fn expired(&mut self, now: u64) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(&(conn_id, expires_at)) = self.queue.front() {
            match self.deadlines.get(&conn_id) {
                // superseded or cleared entry: drop and keep walking
                Some(&current) if current != expires_at => {
                    self.queue.pop_front();
                }
                None => {
                    self.queue.pop_front();
                }
                Some(_) if expires_at <= now => {
                    self.queue.pop_front();
                    self.deadlines.remove(&conn_id);
                    out.push(conn_id);
                }
                // first live deadline in the future ends the sweep
                Some(_) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn expiry_follows_insertion_order() {
        let mut queue = KeepAliveQueue::new();
        queue.renew(1, 5);
        queue.renew(2, 6);
        queue.renew(3, 7);

        assert_eq!(queue.expired(6), vec![1, 2]);
        assert!(queue.contains(3));
        assert_eq!(queue.expired(7), vec![3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn renewal_moves_connection_to_the_back() {
        let mut queue = KeepAliveQueue::new();
        queue.renew(1, 5);
        queue.renew(2, 6);
        queue.renew(1, 8);

        assert_eq!(queue.expired(6), vec![2]);
        assert_eq!(queue.expired(8), vec![1]);
    }

    #[test]
    fn removed_timers_never_expire() {
        let mut queue = KeepAliveQueue::new();
        queue.renew(1, 5);
        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert!(queue.expired(100).is_empty());
    }

    #[test]
    fn boundary_is_inclusive() {
        let mut queue = KeepAliveQueue::new();
        queue.renew(1, 5);
        assert!(queue.expired(4).is_empty());
        assert_eq!(queue.expired(5), vec![1]);
    }

    proptest! {
        /// With a constant timeout and nondecreasing renewal times, the
        /// live queue entries are monotonically nondecreasing in expiry,
        /// so a sweep never has to look past the first live entry.
        #[test]
        fn constant_timeout_keeps_order(
            renewals in proptest::collection::vec((0u64..8, 0u64..50), 1..64),
        ) {
            const TIMEOUT: u64 = 10;

            let mut queue = KeepAliveQueue::new();
            let mut now = 0;
            for (conn, step) in renewals {
                now += step;
                queue.renew(conn, now + TIMEOUT);
            }

            let mut last = 0;
            for &(conn_id, expires_at) in &queue.queue {
                if queue.deadlines.get(&conn_id) == Some(&expires_at) {
                    prop_assert!(expires_at >= last);
                    last = expires_at;
                }
            }
        }

        /// Under constant-timeout renewal a sweep at time T expires exactly
        /// the armed deadlines ≤ T, despite the short-circuit.
        #[test]
        fn sweep_matches_deadlines(
            renewals in proptest::collection::vec((0u64..8, 0u64..6), 1..32),
            extra in 0u64..32,
        ) {
            const TIMEOUT: u64 = 10;

            let mut queue = KeepAliveQueue::new();
            let mut now = 0;
            for (conn, step) in &renewals {
                now += step;
                queue.renew(*conn, now + TIMEOUT);
            }
            let sweep_at = now + extra;

            let armed: HashMap<u64, u64> = queue.deadlines.clone();
            let mut expected: Vec<u64> = armed
                .iter()
                .filter(|(_, &at)| at <= sweep_at)
                .map(|(&id, _)| id)
                .collect();
            expected.sort_unstable();

            let mut got = queue.expired(sweep_at);
            got.sort_unstable();
            prop_assert_eq!(got, expected);
        }
    }
}
