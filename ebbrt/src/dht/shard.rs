//! State owned by one hash-table node.
//!
//! The shard never calls out: operations that release waiters return them,
//! and the caller resolves them after dropping the shard lock.

use crate::messaging::{Completion, NetworkId};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

/// Someone parked on a key's accumulated delta.
#[derive(Debug)]
pub enum Waiter {
    /// A reader in this process.
    Local(Completion<Option<Bytes>>),
    /// A reader elsewhere, answered with a GET response.
    Remote {
        /// Where to send the response.
        from: NetworkId,
        /// Operation id to echo.
        op_id: u32,
    },
}

#[derive(Debug, Default)]
struct Accumulator {
    total: u64,
    // (threshold, arrival) orders by threshold, then first come first served.
    waiters: BTreeMap<(u64, u64), Waiter>,
}

/// Values, counters and accumulators for the keys this node owns.
#[derive(Debug, Default)]
pub struct Shard {
    values: HashMap<Bytes, Bytes>,
    counters: HashMap<Bytes, u64>,
    accumulators: HashMap<Bytes, Accumulator>,
    arrivals: u64,
}

impl Shard {
    /// Empty shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.values.get(key).cloned()
    }

    /// Overwrite the value of `key`.
    pub fn set(&mut self, key: Bytes, value: Bytes) {
        self.values.insert(key, value);
    }

    /// Remove the value of `key`, returning it.
    pub fn free(&mut self, key: &[u8]) -> Option<Bytes> {
        self.values.remove(key)
    }

    /// Bump the counter of `key` and return its previous value.
    pub fn increment(&mut self, key: Bytes) -> u64 {
        let counter = self.counters.entry(key).or_insert(0);
        let previous = *counter;
        *counter = counter.wrapping_add(1);
        previous
    }

    /// Register `waiter` for `key` reaching `wait_for`.
    ///
    /// Returns the waiter with the current value if the threshold is already
    /// met; otherwise parks it and returns `None`.
    pub fn sync_get(&mut self, key: Bytes, wait_for: u64, waiter: Waiter) -> Option<(Waiter, Option<Bytes>)> {
        let total = self.accumulators.get(&key).map_or(0, |acc| acc.total);
        if total >= wait_for {
            return Some((waiter, self.get(&key)));
        }
        let arrival = self.arrivals;
        self.arrivals += 1;
        self.accumulators
            .entry(key)
            .or_default()
            .waiters
            .insert((wait_for, arrival), waiter);
        None
    }

    /// Write `value`, add `delta` and detach every waiter now satisfied.
    ///
    /// Released waiters come back in ascending threshold order, ties in
    /// arrival order, each paired with the value just written.
    pub fn sync_set(&mut self, key: Bytes, value: Bytes, delta: u64) -> Vec<(Waiter, Option<Bytes>)> {
        self.values.insert(key.clone(), value.clone());
        let acc = self.accumulators.entry(key).or_default();
        acc.total = acc.total.saturating_add(delta);

        // Keys strictly above (total, MAX) are still waiting.
        let still_waiting = match acc.total.checked_add(1) {
            Some(bound) => acc.waiters.split_off(&(bound, 0)),
            None => BTreeMap::new(),
        };
        let released = std::mem::replace(&mut acc.waiters, still_waiting);
        released
            .into_values()
            .map(|waiter| (waiter, Some(value.clone())))
            .collect()
    }

    /// Drop every value, counter and accumulated delta.
    ///
    /// Parked waiters stay parked against a reset total.
    pub fn flush(&mut self) {
        self.values.clear();
        self.counters.clear();
        self.accumulators.retain(|_, acc| {
            acc.total = 0;
            !acc.waiters.is_empty()
        });
    }

    /// Number of waiters parked on `key`.
    pub fn parked(&self, key: &[u8]) -> usize {
        self.accumulators.get(key).map_or(0, |acc| acc.waiters.len())
    }

    /// Accumulated delta of `key`.
    pub fn accumulated(&self, key: &[u8]) -> u64 {
        self.accumulators.get(key).map_or(0, |acc| acc.total)
    }
}
