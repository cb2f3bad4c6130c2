//! Event/telemetry counters: thread-local subcounts folded into a shared,
//! mutex-protected total at flush points. Grounded on the teacher's
//! `source_metrics.rs`/`metrics.rs` (per-field atomics, periodic fold).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum EventType {
    ByteReceived = 0,
    PacketReceived,
    PacketGood,
    PacketBad,
    PacketDropped,
    PacketEndOfStream,
    BeamIdMismatch,
    StreamMismatch,
    AssemblerHit,
    AssemblerMiss,
    AssembledChunkDropped,
    AssembledChunkQueued,
}

pub const NUM_EVENT_TYPES: usize = 12;

const ALL_EVENT_TYPES: [EventType; NUM_EVENT_TYPES] = [
    EventType::ByteReceived,
    EventType::PacketReceived,
    EventType::PacketGood,
    EventType::PacketBad,
    EventType::PacketDropped,
    EventType::PacketEndOfStream,
    EventType::BeamIdMismatch,
    EventType::StreamMismatch,
    EventType::AssemblerHit,
    EventType::AssemblerMiss,
    EventType::AssembledChunkDropped,
    EventType::AssembledChunkQueued,
];

/// Per-thread, non-atomic subcounts accumulated between flush points.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSubcounts {
    counts: [u64; NUM_EVENT_TYPES],
}

impl EventSubcounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, ty: EventType) {
        self.counts[ty as usize] += 1;
    }

    pub fn add(&mut self, ty: EventType, n: u64) {
        self.counts[ty as usize] += n;
    }
}

/// Shared, atomic totals; subcounts fold in via [`EventCounts::flush`].
#[derive(Debug, Default)]
pub struct EventCounts {
    totals: [AtomicU64; NUM_EVENT_TYPES],
}

impl EventCounts {
    pub fn new() -> Self {
        Self {
            totals: Default::default(),
        }
    }

    pub fn flush(&self, sub: &mut EventSubcounts) {
        for ty in ALL_EVENT_TYPES {
            let n = sub.counts[ty as usize];
            if n != 0 {
                self.totals[ty as usize].fetch_add(n, Ordering::Relaxed);
                sub.counts[ty as usize] = 0;
            }
        }
    }

    pub fn get(&self, ty: EventType) -> u64 {
        self.totals[ty as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> [u64; NUM_EVENT_TYPES] {
        let mut out = [0u64; NUM_EVENT_TYPES];
        for ty in ALL_EVENT_TYPES {
            out[ty as usize] = self.get(ty);
        }
        out
    }
}

/// Per-sender-address packet counter, flushed at the same cadence as
/// [`EventCounts`] (once per packet list, once per cancellation check).
#[derive(Debug, Default)]
pub struct PerHostCounters {
    counts: Mutex<HashMap<SocketAddr, u64>>,
}

impl PerHostCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, addr: SocketAddr, n: u64) {
        let mut map = self.counts.lock().unwrap();
        *map.entry(addr).or_insert(0) += n;
    }

    pub fn snapshot(&self) -> HashMap<SocketAddr, u64> {
        self.counts.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_folds_and_resets_subcounts() {
        let totals = EventCounts::new();
        let mut sub = EventSubcounts::new();
        sub.incr(EventType::PacketGood);
        sub.incr(EventType::PacketGood);
        sub.incr(EventType::PacketBad);
        totals.flush(&mut sub);
        assert_eq!(totals.get(EventType::PacketGood), 2);
        assert_eq!(totals.get(EventType::PacketBad), 1);
        assert_eq!(sub.counts[EventType::PacketGood as usize], 0);

        sub.incr(EventType::PacketGood);
        totals.flush(&mut sub);
        assert_eq!(totals.get(EventType::PacketGood), 3);
    }

    #[test]
    fn perhost_counters_accumulate_by_address() {
        let hosts = PerHostCounters::new();
        let a: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        hosts.record(a, 3);
        hosts.record(a, 4);
        let snap = hosts.snapshot();
        assert_eq!(snap[&a], 7);
    }

    #[test]
    fn event_count_conservation() {
        let totals = EventCounts::new();
        let mut sub = EventSubcounts::new();
        for _ in 0..5 {
            sub.incr(EventType::PacketReceived);
            sub.incr(EventType::PacketGood);
        }
        sub.incr(EventType::PacketReceived);
        sub.incr(EventType::PacketBad);
        totals.flush(&mut sub);
        let received = totals.get(EventType::PacketReceived);
        let good = totals.get(EventType::PacketGood);
        let bad = totals.get(EventType::PacketBad);
        let sm = totals.get(EventType::StreamMismatch);
        let eos = totals.get(EventType::PacketEndOfStream);
        assert_eq!(received, good + bad + sm + eos);
    }
}
