//! Monotonic packet counters (C1).
//!
//! Two flavors: a lock-free [`Stats`] for single-threaded per-ring use, and
//! a mutex-guarded [`SharedStats`] for the descriptor-wide aggregate that
//! every worker thread increments.

use crate::error::{Result, RxtxError};
use std::sync::Mutex;

/// The four counters tracked per-ring and descriptor-wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub packets_received: u64,
    pub packets_unreliable: u64,
    pub tp_packets: u64,
    pub tp_drops: u64,
}

impl Counters {
    fn increment(&mut self, field: Field, step: u64) {
        let counter = match field {
            Field::PacketsReceived => &mut self.packets_received,
            Field::PacketsUnreliable => &mut self.packets_unreliable,
            Field::TpPackets => &mut self.tp_packets,
            Field::TpDrops => &mut self.tp_drops,
        };
        *counter = counter.saturating_add(step);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    PacketsReceived,
    PacketsUnreliable,
    TpPackets,
    TpDrops,
}

/// Per-ring stats: plain counters, no synchronization. Must only ever be
/// touched by the single worker thread that owns the ring.
#[derive(Debug, Default)]
pub struct Stats(Counters);

impl Stats {
    pub fn new() -> Self {
        Stats(Counters::default())
    }

    pub fn get(&self, field: Field) -> u64 {
        match field {
            Field::PacketsReceived => self.0.packets_received,
            Field::PacketsUnreliable => self.0.packets_unreliable,
            Field::TpPackets => self.0.tp_packets,
            Field::TpDrops => self.0.tp_drops,
        }
    }

    pub fn increment(&mut self, field: Field, step: u64) {
        self.0.increment(field, step);
    }

    pub fn snapshot(&self) -> Counters {
        self.0
    }
}

/// Descriptor-wide aggregate stats: every read and write is serialized by
/// a mutex since multiple worker threads share it.
#[derive(Debug)]
pub struct SharedStats {
    inner: Mutex<Counters>,
}

impl SharedStats {
    pub fn new() -> Result<Self> {
        Ok(SharedStats {
            inner: Mutex::new(Counters::default()),
        })
    }

    pub fn get(&self, field: Field) -> Result<u64> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| RxtxError::Resource("stats mutex poisoned".into()))?;
        Ok(match field {
            Field::PacketsReceived => guard.packets_received,
            Field::PacketsUnreliable => guard.packets_unreliable,
            Field::TpPackets => guard.tp_packets,
            Field::TpDrops => guard.tp_drops,
        })
    }

    pub fn increment(&self, field: Field, step: u64) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| RxtxError::Resource("stats mutex poisoned".into()))?;
        guard.increment(field, step);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Counters> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| RxtxError::Resource("stats mutex poisoned".into()))?;
        Ok(*guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_ring_stats_increment_and_get() {
        let mut s = Stats::new();
        s.increment(Field::PacketsReceived, 1);
        s.increment(Field::PacketsReceived, 1);
        s.increment(Field::PacketsUnreliable, 3);
        assert_eq!(s.get(Field::PacketsReceived), 2);
        assert_eq!(s.get(Field::PacketsUnreliable), 3);
        assert_eq!(s.get(Field::TpPackets), 0);
    }

    #[test]
    fn shared_stats_are_monotonic_across_threads() {
        let shared = std::sync::Arc::new(SharedStats::new().unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    shared.increment(Field::PacketsReceived, 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.get(Field::PacketsReceived).unwrap(), 4000);
    }
}
