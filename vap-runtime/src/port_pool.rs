//! Host-port allocation for sandbox containers.
//!
//! Three disjoint sets partition the configured range: `free`, `in_use`,
//! `cooldown`. Released ports sit in cooldown for a configured period
//! before becoming allocatable again, so a just-retired port cannot be
//! handed to the next job while anything might still be talking to it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

pub struct PortPool {
    free: BTreeSet<u16>,
    in_use: BTreeSet<u16>,
    cooldown: BTreeMap<u16, Instant>,
    cooldown_period: Duration,
}

impl PortPool {
    pub fn new(start: u16, end: u16, cooldown_period: Duration) -> Self {
        Self {
            free: (start..=end).collect(),
            in_use: BTreeSet::new(),
            cooldown: BTreeMap::new(),
            cooldown_period,
        }
    }

    /// Take the lowest allocatable port, or `None` when the pool is
    /// exhausted (everything in use or cooling down).
    pub fn allocate(&mut self) -> Option<u16> {
        self.allocate_at(Instant::now())
    }

    pub fn allocate_at(&mut self, now: Instant) -> Option<u16> {
        self.reap(now);
        let port = *self.free.iter().next()?;
        self.free.remove(&port);
        self.in_use.insert(port);
        Some(port)
    }

    /// Move an in-use port into cooldown. Unknown ports are ignored.
    pub fn release(&mut self, port: u16) {
        self.release_at(port, Instant::now());
    }

    pub fn release_at(&mut self, port: u16, now: Instant) {
        if self.in_use.remove(&port) {
            self.cooldown.insert(port, now + self.cooldown_period);
        }
    }

    fn reap(&mut self, now: Instant) {
        let due: Vec<u16> = self
            .cooldown
            .iter()
            .filter(|(_, eligible)| **eligible <= now)
            .map(|(port, _)| *port)
            .collect();
        for port in due {
            self.cooldown.remove(&port);
            self.free.insert(port);
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn cooldown_count(&self) -> usize {
        self.cooldown.len()
    }

    /// Set invariant: pairwise disjoint, union covers the whole range.
    pub fn is_consistent(&self) -> bool {
        let total = self.free.len() + self.in_use.len() + self.cooldown.len();
        let mut all: BTreeSet<u16> = self.free.clone();
        all.extend(self.in_use.iter().copied());
        all.extend(self.cooldown.keys().copied());
        all.len() == total
    }
}
