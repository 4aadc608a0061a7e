//! Completion Callback Stack
//!
//! Each layer a packet passes through on the way down may push a completion
//! callback; the callbacks run in reverse order on the way back up. Storage
//! only lives here; the unwind loop itself is on [`Packet`].
//!
//! [`Packet`]: crate::packet::Packet

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use crate::packet::packet::Packet;

/// Maximum nesting of completion callbacks per packet
pub const COMPLETION_STACK_DEPTH: usize = 16;

/// Completion level of a packet with no callbacks registered
pub const DEFAULT_LEVEL: i8 = -1;

/// What the unwind loop should do after a callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDisposition {
    /// Keep unwinding toward level zero
    Continue,
    /// Ownership transferred; stop unwinding, the packet completes later
    MoreProcessing,
    /// The callback re-pushed work; re-read the current level and resume
    Restart,
}

/// A completion callback. Receives the packet being unwound.
pub type CompletionFn =
    Box<dyn FnMut(&mut Packet) -> CompletionDisposition + Send>;

/// Fixed-depth callback storage
pub(crate) struct CompletionStack {
    slots: [Option<CompletionFn>; COMPLETION_STACK_DEPTH],
}

impl CompletionStack {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub(crate) fn set(&mut self, level: usize, callback: CompletionFn) {
        self.slots[level] = Some(callback);
    }

    pub(crate) fn take(&mut self, level: usize) -> Option<CompletionFn> {
        self.slots[level].take()
    }

    pub(crate) fn peek_id(&self, level: usize) -> usize {
        self.slots[level]
            .as_ref()
            .map(callback_id)
            .unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for CompletionStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let occupied: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        f.debug_struct("CompletionStack")
            .field("occupied", &occupied)
            .finish()
    }
}

/// Stable identity of a boxed callback, for tracker records
pub(crate) fn callback_id(callback: &CompletionFn) -> usize {
    let fat: *const (dyn FnMut(&mut Packet) -> CompletionDisposition + Send) =
        &**callback;
    fat as *const () as usize
}

// ============================================================================
// Synchronous completion adapter
// ============================================================================

/// Blocks a calling thread until an asynchronously submitted packet
/// completes. Intended for bring-up paths and tests.
#[derive(Clone, Default)]
pub struct SyncCompletion {
    inner: Arc<SyncInner>,
}

#[derive(Default)]
struct SyncInner {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl SyncCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// A completion callback that signals this adapter and keeps unwinding
    pub fn completion(&self) -> CompletionFn {
        let inner = Arc::clone(&self.inner);
        Box::new(move |_packet| {
            let mut done = inner.done.lock();
            *done = true;
            inner.condvar.notify_all();
            CompletionDisposition::Continue
        })
    }

    /// Block until the paired callback has run
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.condvar.wait(&mut done);
        }
    }

    /// Block with a timeout; returns false if it elapsed
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if *done {
            return true;
        }
        self.inner.condvar.wait_for(&mut done, timeout);
        *done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_take_round_trip() {
        let mut stack = CompletionStack::new();
        stack.set(0, Box::new(|_| CompletionDisposition::Continue));
        assert!(stack.peek_id(0) != 0);
        assert!(stack.take(0).is_some());
        assert!(stack.take(0).is_none());
        assert_eq!(stack.peek_id(0), 0);
    }

    #[test]
    fn test_sync_completion_signals() {
        let sync = SyncCompletion::new();
        assert!(!sync.wait_for(Duration::from_millis(10)));

        let signaler = sync.clone();
        let mut callback = signaler.completion();
        let mut packet = Packet::new();
        assert_eq!(callback(&mut packet), CompletionDisposition::Continue);
        assert!(sync.wait_for(Duration::from_millis(10)));
        sync.wait();
    }
}
