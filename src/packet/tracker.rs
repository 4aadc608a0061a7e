//! Completion Tracker Ring
//!
//! A small fixed-size ring of diagnostic records. Every completion stack
//! push and every callback invocation writes one entry, so a hung or
//! misrouted packet can be read back post-mortem. The ring never allocates
//! and never blocks; when full it overwrites the oldest entry and bumps a
//! wrap counter.

use std::sync::OnceLock;
use std::time::Instant;

use bitflags::bitflags;

/// Number of records retained per packet
pub const TRACKER_DEPTH: usize = 16;

bitflags! {
    /// What the recorded event was
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrackerAction: u8 {
        /// A completion callback was pushed onto the stack
        const SET = 0x01;
        /// A completion callback was invoked during unwind
        const COMPLETE = 0x02;
        /// The packet was marked canceled
        const CANCELED = 0x04;
        /// The packet expired
        const EXPIRED = 0x08;
    }
}

/// One diagnostic record
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerEntry {
    /// Identity of the callback involved (its allocation address)
    pub callback_id: usize,
    /// Coarse milliseconds since process start
    pub coarse_time_ms: u64,
    pub action: TrackerAction,
}

/// Per-packet ring of [`TrackerEntry`] records
#[derive(Debug)]
pub struct TrackerRing {
    entries: [TrackerEntry; TRACKER_DEPTH],
    index: usize,
    wrap_count: u32,
}

impl Default for TrackerRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerRing {
    pub fn new() -> Self {
        Self {
            entries: [TrackerEntry::default(); TRACKER_DEPTH],
            index: 0,
            wrap_count: 0,
        }
    }

    pub fn record(&mut self, callback_id: usize, action: TrackerAction) {
        self.entries[self.index] = TrackerEntry {
            callback_id,
            coarse_time_ms: coarse_time_ms(),
            action,
        };
        self.index += 1;
        if self.index == TRACKER_DEPTH {
            self.index = 0;
            self.wrap_count += 1;
        }
    }

    /// How many times the ring has lapped itself
    pub fn wrap_count(&self) -> u32 {
        self.wrap_count
    }

    /// Snapshot of recorded entries, oldest first
    pub fn snapshot(&self) -> Vec<TrackerEntry> {
        let mut out = Vec::with_capacity(TRACKER_DEPTH);
        if self.wrap_count > 0 {
            out.extend_from_slice(&self.entries[self.index..]);
        }
        out.extend_from_slice(&self.entries[..self.index]);
        out
    }

    pub fn reset(&mut self) {
        self.entries = [TrackerEntry::default(); TRACKER_DEPTH];
        self.index = 0;
        self.wrap_count = 0;
    }
}

/// Coarse monotonic milliseconds since the first call in this process
pub(crate) fn coarse_time_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}
