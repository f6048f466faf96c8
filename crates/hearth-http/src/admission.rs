//! Admission control: global and per-IP-block connection counters.
//!
//! Both caps are inclusive. The crossing test compares the post-increment
//! value against the limit, so the Nth connection under a cap of N is
//! admitted and the (N+1)th is denied with both counters rolled back.
//! Unix-domain peers carry no block key and only count globally.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Aggregation key for the per-IP quota.
///
/// IPv4 uses the full address; IPv6 keeps the first 7 bytes, grouping a
/// /56 into one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpBlock {
    /// Full IPv4 address.
    V4([u8; 4]),
    /// First 7 bytes of the IPv6 address (≈/56).
    V6([u8; 7]),
}

impl IpBlock {
    /// Derives the block key from a peer address.
    #[must_use]
    pub fn from_addr(addr: &SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::V4(ip.octets()),
            IpAddr::V6(ip) => {
                let octets = ip.octets();
                let mut block = [0u8; 7];
                block.copy_from_slice(&octets[..7]);
                Self::V6(block)
            }
        }
    }
}

/// Connection counters enforcing the process-wide and per-block caps.
#[derive(Debug)]
pub struct AdmissionCounters {
    total: usize,
    per_block: HashMap<IpBlock, usize>,
    max_connections: usize,
    connections_per_ip: usize,
}

impl AdmissionCounters {
    /// Creates counters with the given inclusive caps.
    #[must_use]
    pub fn new(max_connections: usize, connections_per_ip: usize) -> Self {
        Self {
            total: 0,
            per_block: HashMap::new(),
            max_connections,
            connections_per_ip,
        }
    }

    /// Tries to admit a connection. `block` is `None` for unix-domain
    /// peers, which are exempt from the per-block cap.
    ///
    /// Returns false (and leaves both counters untouched) when either cap
    /// was crossed.
    pub fn try_admit(&mut self, block: Option<IpBlock>) -> bool {
        self.total += 1;
        if self.total > self.max_connections {
            self.total -= 1;
            return false;
        }

        if let Some(block) = block {
            let count = self.per_block.entry(block).or_insert(0);
            *count += 1;
            if *count > self.connections_per_ip {
                *count -= 1;
                if *count == 0 {
                    self.per_block.remove(&block);
                }
                self.total -= 1;
                return false;
            }
        }

        true
    }

    /// Releases a previously admitted connection.
    pub fn release(&mut self, block: Option<IpBlock>) {
        debug_assert!(self.total > 0, "release without matching admit");
        self.total = self.total.saturating_sub(1);

        if let Some(block) = block {
            if let Some(count) = self.per_block.get_mut(&block) {
                *count -= 1;
                if *count == 0 {
                    self.per_block.remove(&block);
                }
            } else {
                debug_assert!(false, "release for untracked block");
            }
        }
    }

    /// Current global count.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Count for one block.
    #[must_use]
    pub fn block_count(&self, block: IpBlock) -> usize {
        self.per_block.get(&block).copied().unwrap_or(0)
    }

    /// Number of distinct blocks with at least one connection.
    #[must_use]
    pub fn unique_blocks(&self) -> usize {
        self.per_block.len()
    }

    /// Sum of all per-block counts. Equals [`total`](Self::total) when
    /// every connection carried a block key.
    #[must_use]
    pub fn block_sum(&self) -> usize {
        self.per_block.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> Option<IpBlock> {
        Some(IpBlock::V4([a, b, c, d]))
    }

    #[test]
    fn ipv6_aggregates_to_seven_bytes() {
        let one: SocketAddr = "[2001:db8:0:1:aa::1]:1000".parse().unwrap();
        let two: SocketAddr = "[2001:db8:0:1:bb::2]:2000".parse().unwrap();
        let other: SocketAddr = "[2001:db8:0:200::1]:3000".parse().unwrap();

        // same /56: only interface bits differ
        assert_eq!(IpBlock::from_addr(&one), IpBlock::from_addr(&two));
        assert_ne!(IpBlock::from_addr(&one), IpBlock::from_addr(&other));
    }

    #[test]
    fn ipv4_uses_full_address() {
        let one: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let two: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_ne!(IpBlock::from_addr(&one), IpBlock::from_addr(&two));
    }

    #[test]
    fn global_cap_is_inclusive() {
        let mut counters = AdmissionCounters::new(2, 100);
        assert!(counters.try_admit(v4(10, 0, 0, 1)));
        assert!(counters.try_admit(v4(10, 0, 0, 2)));
        // the (N+1)th is denied, counters untouched
        assert!(!counters.try_admit(v4(10, 0, 0, 3)));
        assert_eq!(counters.total(), 2);
        assert_eq!(counters.block_sum(), 2);

        counters.release(v4(10, 0, 0, 1));
        assert!(counters.try_admit(v4(10, 0, 0, 3)));
    }

    #[test]
    fn per_block_cap_rolls_back_both() {
        let mut counters = AdmissionCounters::new(100, 1);
        assert!(counters.try_admit(v4(10, 0, 0, 1)));
        assert!(!counters.try_admit(v4(10, 0, 0, 1)));
        assert_eq!(counters.total(), 1);
        assert_eq!(counters.block_count(IpBlock::V4([10, 0, 0, 1])), 1);

        // a different block is unaffected
        assert!(counters.try_admit(v4(10, 0, 0, 2)));
        assert_eq!(counters.unique_blocks(), 2);
    }

    #[test]
    fn unix_peers_skip_block_accounting() {
        let mut counters = AdmissionCounters::new(2, 1);
        assert!(counters.try_admit(None));
        assert!(counters.try_admit(None));
        assert!(!counters.try_admit(None));
        assert_eq!(counters.unique_blocks(), 0);

        counters.release(None);
        counters.release(None);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn admit_release_round_trip_restores_counters() {
        let mut counters = AdmissionCounters::new(8, 8);
        assert!(counters.try_admit(v4(192, 168, 1, 1)));
        counters.release(v4(192, 168, 1, 1));
        assert_eq!(counters.total(), 0);
        assert_eq!(counters.unique_blocks(), 0);
        assert_eq!(counters.block_sum(), 0);
    }

    proptest! {
        /// Any admit/release interleaving keeps the counters conserved:
        /// total equals currently tracked connections, per-block sums match
        /// the global count, and nothing underflows.
        #[test]
        fn counters_are_conserved(ops in proptest::collection::vec((0u8..4, 0u8..4), 0..64)) {
            let mut counters = AdmissionCounters::new(5, 3);
            let mut live: Vec<Option<IpBlock>> = Vec::new();

            for (action, which) in ops {
                if action == 0 && !live.is_empty() {
                    let block = live.remove(which as usize % live.len());
                    counters.release(block);
                } else {
                    let block = v4(10, 0, 0, which);
                    if counters.try_admit(block) {
                        live.push(block);
                    }
                }

                prop_assert_eq!(counters.total(), live.len());
                prop_assert_eq!(counters.block_sum(), live.len());
                prop_assert!(counters.total() <= 5);
            }
        }
    }
}
