//! Run Queue Dispatcher
//!
//! Per-core worker threads that drain deferred completions. A packet
//! pushed here has its completion stack unwound on a worker instead of
//! the caller's stack, which is how deep completion chains avoid stack
//! growth and how cross-core handoff happens.
//!
//! ```text
//!   push(packet, policy) ──▶ core queue ──▶ worker ──▶ packet.complete()
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::packet::{CompletionFn, Packet};

/// Queue-depth histogram buckets: depth 1, 2, 4, 8, ... then overflow
pub const DEPTH_HISTOGRAM_BUCKETS: usize = 8;

/// How a pushed packet picks its core queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Run on the packet's recorded core; falls back to round-robin
    #[default]
    SameCore,
    /// Run on the core after the packet's recorded one
    NextCore,
    /// Ignore affinity, spread across all cores
    RoundRobin,
}

struct CoreQueue {
    queue: Mutex<VecDeque<Packet>>,
    condvar: Condvar,
}

struct Shared {
    cores: Vec<CoreQueue>,
    round_robin: AtomicUsize,
    shutdown: AtomicBool,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
    total_pushes: AtomicU64,
    depth_histogram: [AtomicU64; DEPTH_HISTOGRAM_BUCKETS],
}

/// Point-in-time dispatcher counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunQueueStats {
    pub cores: usize,
    pub current_depth: usize,
    pub max_depth: usize,
    pub total_pushes: u64,
    pub depth_histogram: [u64; DEPTH_HISTOGRAM_BUCKETS],
}

/// A packet the dispatcher refused, handed back to the caller
#[derive(Debug)]
pub struct RejectedPacket {
    pub packet: Packet,
    pub error: Error,
}

/// Configuration for a [`RunQueue`]
#[derive(Debug, Clone)]
pub struct RunQueueConfig {
    /// Worker threads to spawn, one per core queue
    pub cores: usize,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { cores }
    }
}

/// Deferred-completion dispatcher with one worker thread per core
pub struct RunQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RunQueue {
    /// Spawn `cores` worker threads
    pub fn new(cores: usize) -> Result<Self> {
        if cores == 0 {
            return Err(Error::InvalidCore { core: 0, cores });
        }
        let shared = Arc::new(Shared {
            cores: (0..cores)
                .map(|_| CoreQueue {
                    queue: Mutex::new(VecDeque::new()),
                    condvar: Condvar::new(),
                })
                .collect(),
            round_robin: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            total_pushes: AtomicU64::new(0),
            depth_histogram: std::array::from_fn(|_| AtomicU64::new(0)),
        });
        let workers = (0..cores)
            .map(|core| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("run-queue-{core}"))
                    .spawn(move || worker_loop(&shared, core))
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|_| Error::RunQueueShutdown)?;
        info!(cores, "run queue started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn with_config(config: &RunQueueConfig) -> Result<Self> {
        Self::new(config.cores)
    }

    pub fn cores(&self) -> usize {
        self.shared.cores.len()
    }

    /// Hand a packet to a worker for deferred completion.
    /// On rejection the packet comes back untouched.
    pub fn push(
        &self,
        packet: Packet,
        policy: DispatchPolicy,
    ) -> std::result::Result<(), RejectedPacket> {
        let core = self.pick_core(&packet, policy);
        let slot = &self.shared.cores[core];
        {
            let mut queue = slot.queue.lock();
            // Checked under the queue lock: shutdown sets the flag before
            // draining, so a packet enqueued here is either popped by a
            // worker or returned by the drain, never stranded.
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(RejectedPacket {
                    packet,
                    error: Error::RunQueueShutdown,
                });
            }
            self.record_push();
            queue.push_back(packet);
        }
        slot.condvar.notify_one();
        Ok(())
    }

    /// Push with one more completion callback on top, so the caller can
    /// observe the deferred unwind.
    pub fn push_with(
        &self,
        mut packet: Packet,
        policy: DispatchPolicy,
        completion: CompletionFn,
    ) -> std::result::Result<(), RejectedPacket> {
        if let Err(error) = packet.set_completion(completion) {
            return Err(RejectedPacket { packet, error });
        }
        self.push(packet, policy)
    }

    pub fn stats(&self) -> RunQueueStats {
        RunQueueStats {
            cores: self.shared.cores.len(),
            current_depth: self.shared.depth.load(Ordering::Acquire),
            max_depth: self.shared.max_depth.load(Ordering::Acquire),
            total_pushes: self.shared.total_pushes.load(Ordering::Acquire),
            depth_histogram: std::array::from_fn(|i| {
                self.shared.depth_histogram[i].load(Ordering::Acquire)
            }),
        }
    }

    /// Stop accepting work, drain nothing, and join the workers.
    /// Packets still queued are returned unprocessed.
    pub fn shutdown(&self) -> Vec<Packet> {
        self.shared.shutdown.store(true, Ordering::Release);
        for core in &self.shared.cores {
            core.condvar.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("run queue worker panicked");
            }
        }
        let mut leftover = Vec::new();
        for core in &self.shared.cores {
            leftover.extend(core.queue.lock().drain(..));
        }
        self.shared
            .depth
            .fetch_sub(leftover.len(), Ordering::AcqRel);
        leftover
    }

    fn pick_core(&self, packet: &Packet, policy: DispatchPolicy) -> usize {
        let cores = self.shared.cores.len();
        let rr = || self.shared.round_robin.fetch_add(1, Ordering::Relaxed) % cores;
        match policy {
            DispatchPolicy::SameCore => {
                packet.core_id().map(|c| c % cores).unwrap_or_else(rr)
            }
            DispatchPolicy::NextCore => packet
                .core_id()
                .map(|c| (c + 1) % cores)
                .unwrap_or_else(rr),
            DispatchPolicy::RoundRobin => rr(),
        }
    }

    fn record_push(&self) {
        self.shared.total_pushes.fetch_add(1, Ordering::Relaxed);
        let depth = self.shared.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.max_depth.fetch_max(depth, Ordering::AcqRel);
        let bucket = (usize::BITS - 1 - depth.leading_zeros()) as usize;
        let bucket = bucket.min(DEPTH_HISTOGRAM_BUCKETS - 1);
        self.shared.depth_histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

fn worker_loop(shared: &Shared, core: usize) {
    let slot = &shared.cores[core];
    loop {
        let packet = {
            let mut queue = slot.queue.lock();
            loop {
                if let Some(packet) = queue.pop_front() {
                    break Some(packet);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                slot.condvar.wait(&mut queue);
            }
        };
        let Some(mut packet) = packet else {
            debug!(core, "run queue worker exiting");
            return;
        };
        shared.depth.fetch_sub(1, Ordering::AcqRel);
        packet.set_core_id(core);
        if let Err(err) = packet.complete() {
            error!(core, packet = packet.id(), %err, "deferred completion failed");
        }
    }
}
