//! Expiration Timer
//!
//! Packets with deadlines are parked here. A single sweeper thread wakes
//! for the earliest deadline, stamps expired packets with the `Expired`
//! status, and delivers them through the normal completion path, either
//! inline or on a run queue when one is attached.
//!
//! The race between normal completion and expiration is settled by
//! ownership: a parked packet belongs to the timer, and `cancel` is the
//! only way to get it back. Whoever removes the packet from the table,
//! canceler or sweeper, is the one and only completer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::packet::tracker::coarse_time_ms;
use crate::packet::Packet;
use crate::run_queue::{DispatchPolicy, RejectedPacket, RunQueue};

/// Identity of a parked packet, needed to cancel its timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    deadline_ms: u64,
    seq: u64,
}

struct TimerInner {
    /// Parked packets ordered by deadline; seq breaks ties
    entries: Mutex<BTreeMap<(u64, u64), Packet>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    run_queue: Option<Arc<RunQueue>>,
}

/// Deadline tracking service with one sweeper thread
pub struct TimerService {
    inner: Arc<TimerInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    /// Expired packets complete inline on the sweeper thread
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Expired packets are handed to the run queue for completion
    pub fn with_run_queue(run_queue: Arc<RunQueue>) -> Self {
        Self::build(Some(run_queue))
    }

    fn build(run_queue: Option<Arc<RunQueue>>) -> Self {
        let inner = Arc::new(TimerInner {
            entries: Mutex::new(BTreeMap::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(1),
            run_queue,
        });
        let sweeper_inner = Arc::clone(&inner);
        let sweeper = std::thread::Builder::new()
            .name("timer-sweeper".into())
            .spawn(move || sweeper_loop(&sweeper_inner))
            .ok();
        if sweeper.is_none() {
            error!("timer sweeper thread failed to start");
        }
        info!("timer service started");
        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Park a packet until it completes or the timeout elapses.
    /// A zero timeout means "no expiration" and is rejected here.
    pub fn start(
        &self,
        mut packet: Packet,
        timeout: Duration,
    ) -> std::result::Result<TimerHandle, RejectedPacket> {
        if timeout.is_zero() {
            return Err(RejectedPacket {
                packet,
                error: Error::ZeroTimeout,
            });
        }
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(RejectedPacket {
                packet,
                error: Error::RunQueueShutdown,
            });
        }
        let deadline_ms = coarse_time_ms()
            .saturating_add(timeout.as_millis() as u64)
            .max(1);
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        packet.set_expiration_time_ms(deadline_ms);
        self.inner
            .entries
            .lock()
            .insert((deadline_ms, seq), packet);
        self.inner.condvar.notify_one();
        Ok(TimerHandle { deadline_ms, seq })
    }

    /// Reclaim a parked packet before it expires. Exactly one of `cancel`
    /// and the sweeper gets any given packet.
    pub fn cancel(&self, handle: TimerHandle) -> Result<Packet> {
        let entry = self
            .inner
            .entries
            .lock()
            .remove(&(handle.deadline_ms, handle.seq));
        match entry {
            Some(mut packet) => {
                packet.clear_expiration();
                Ok(packet)
            }
            None => Err(Error::TimerNotFound { handle: handle.seq }),
        }
    }

    /// Packets currently parked
    pub fn parked(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Stop the sweeper and return packets that never expired
    pub fn shutdown(&self) -> Vec<Packet> {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.condvar.notify_all();
        if let Some(sweeper) = self.sweeper.lock().take() {
            if sweeper.join().is_err() {
                error!("timer sweeper panicked");
            }
        }
        let mut entries = self.inner.entries.lock();
        let remaining = std::mem::take(&mut *entries);
        remaining
            .into_values()
            .map(|mut packet| {
                packet.clear_expiration();
                packet
            })
            .collect()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

fn sweeper_loop(inner: &TimerInner) {
    loop {
        let due = {
            let mut entries = inner.entries.lock();
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = coarse_time_ms();
            let expired_keys: Vec<(u64, u64)> = entries
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect();
            let due: Vec<Packet> = expired_keys
                .into_iter()
                .filter_map(|key| entries.remove(&key))
                .collect();
            if due.is_empty() {
                match entries.keys().next().map(|(deadline, _)| *deadline) {
                    Some(deadline) => {
                        let wait = deadline.saturating_sub(now);
                        inner.condvar.wait_for(
                            &mut entries,
                            Duration::from_millis(wait.max(1)),
                        );
                    }
                    None => {
                        inner.condvar.wait(&mut entries);
                    }
                }
                continue;
            }
            due
        };
        for mut packet in due {
            debug!(packet = packet.id(), "packet expired");
            packet.mark_expired();
            match inner.run_queue.as_deref() {
                Some(run_queue) => {
                    if let Err(rejected) =
                        run_queue.push(packet, DispatchPolicy::SameCore)
                    {
                        // Run queue is gone; fall back to inline delivery
                        let mut packet = rejected.packet;
                        if let Err(err) = packet.complete() {
                            error!(%err, "expired completion failed");
                        }
                    }
                }
                None => {
                    if let Err(err) = packet.complete() {
                        error!(%err, "expired completion failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        CompletionDisposition, PacketState, PacketStatus, StatusCode,
        SyncCompletion,
    };
    use std::sync::atomic::AtomicUsize;

    fn started_packet() -> Packet {
        let mut packet = Packet::new();
        packet.start().unwrap();
        packet
    }

    #[test]
    fn test_expiry_delivers_expired_status() {
        let timer = TimerService::new();
        let mut packet = started_packet();
        let seen = Arc::new(Mutex::new(None));
        // Sync adapter goes on the bottom level so it signals only after
        // the observer above it has run.
        let sync = SyncCompletion::new();
        packet.set_completion(sync.completion()).unwrap();
        let status_seen = Arc::clone(&seen);
        packet
            .set_completion(Box::new(move |p| {
                *status_seen.lock() = Some(p.status().code);
                CompletionDisposition::Continue
            }))
            .unwrap();

        timer.start(packet, Duration::from_millis(20)).unwrap();
        assert!(sync.wait_for(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), Some(StatusCode::Expired));
        assert_eq!(timer.parked(), 0);
    }

    #[test]
    fn test_cancel_reclaims_packet() {
        let timer = TimerService::new();
        let packet = started_packet();
        let id = packet.id();
        let handle = timer
            .start(packet, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(timer.parked(), 1);

        let mut packet = timer.cancel(handle).unwrap();
        assert_eq!(packet.id(), id);
        assert_eq!(packet.expiration_time_ms(), 0);
        assert_eq!(packet.state(), PacketState::InProgress);
        packet.complete_with(PacketStatus::ok()).unwrap();

        assert!(matches!(
            timer.cancel(handle),
            Err(Error::TimerNotFound { .. })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let timer = TimerService::new();
        let packet = started_packet();
        let id = packet.id();
        let rejected = timer.start(packet, Duration::ZERO).unwrap_err();
        assert!(matches!(rejected.error, Error::ZeroTimeout));
        assert_eq!(rejected.packet.id(), id);
    }

    #[test]
    fn test_cancel_and_expiry_complete_exactly_once() {
        let timer = Arc::new(TimerService::new());
        for round in 0..20 {
            let completions = Arc::new(AtomicUsize::new(0));
            let mut packet = started_packet();
            let count = Arc::clone(&completions);
            packet
                .set_completion(Box::new(move |_p| {
                    count.fetch_add(1, Ordering::SeqCst);
                    CompletionDisposition::Continue
                }))
                .unwrap();

            let handle = timer
                .start(packet, Duration::from_millis(3))
                .unwrap();

            let canceler = Arc::clone(&timer);
            let racer = std::thread::spawn(move || {
                if round % 2 == 0 {
                    std::thread::sleep(Duration::from_millis(3));
                }
                canceler.cancel(handle)
            });
            if let Ok(mut packet) = racer.join().unwrap() {
                packet.complete_with(PacketStatus::ok()).unwrap();
            }
            // Give a racing expiry time to (incorrectly) double-complete
            std::thread::sleep(Duration::from_millis(15));
            assert_eq!(completions.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_expiry_routed_through_run_queue() {
        let run_queue = Arc::new(RunQueue::new(2).unwrap());
        let timer = TimerService::with_run_queue(Arc::clone(&run_queue));

        let mut packet = started_packet();
        let seen = Arc::new(Mutex::new(None));
        // Sync adapter below the observer, as above
        let sync = SyncCompletion::new();
        packet.set_completion(sync.completion()).unwrap();
        let core_seen = Arc::clone(&seen);
        packet
            .set_completion(Box::new(move |p| {
                *core_seen.lock() = Some((p.status().code, p.core_id()));
                CompletionDisposition::Continue
            }))
            .unwrap();

        timer.start(packet, Duration::from_millis(10)).unwrap();
        assert!(sync.wait_for(Duration::from_secs(5)));
        let (status, core) = seen.lock().take().unwrap();
        assert_eq!(status, StatusCode::Expired);
        assert!(core.is_some());
        timer.shutdown();
        run_queue.shutdown();
    }

    #[test]
    fn test_shutdown_returns_unexpired_packets() {
        let timer = TimerService::new();
        let packet = started_packet();
        let id = packet.id();
        timer.start(packet, Duration::from_secs(3600)).unwrap();
        let leftover = timer.shutdown();
        assert_eq!(leftover.len(), 1);
        assert_eq!(leftover[0].id(), id);
        assert_eq!(leftover[0].expiration_time_ms(), 0);
    }
}
