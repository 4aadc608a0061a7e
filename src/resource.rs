//! Resource Allocation
//!
//! Every packet embeds a [`ResourceRequest`] so layers can obtain packets,
//! buffers, or chunk runs without blocking the dispatch path. A request is
//! built with a kind and count, submitted to a [`ResourceAllocator`], and
//! completed exactly once with a [`ResourceGrant`]. Completion may be
//! delivered inline from `submit` when the pool can satisfy the request
//! immediately; callers must not assume deferral.
//!
//! ```text
//!   build ──▶ submit ──▶ (inline or deferred) complete ──▶ take_grant
//!                 │                                            │
//!                 └── pending queue, drained on release ◀──────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::packet::Packet;

/// Fixed size of one pool chunk in bytes
pub const CHUNK_SIZE: usize = 4096;

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A fresh packet descriptor
    Packet,
    /// One chunk-sized scratch buffer
    Buffer,
    /// A run of pool chunks
    Chunks,
}

/// What an allocator handed back
pub enum ResourceGrant {
    Packet(Box<Packet>),
    Buffer(BytesMut),
    Chunks(Vec<BytesMut>),
}

impl ResourceGrant {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceGrant::Packet(_) => ResourceKind::Packet,
            ResourceGrant::Buffer(_) => ResourceKind::Buffer,
            ResourceGrant::Chunks(_) => ResourceKind::Chunks,
        }
    }

    /// Accounting weight of this grant
    pub fn credits(&self) -> u64 {
        match self {
            ResourceGrant::Packet(_) | ResourceGrant::Buffer(_) => 1,
            ResourceGrant::Chunks(chunks) => chunks.len() as u64,
        }
    }
}

impl std::fmt::Debug for ResourceGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceGrant::Packet(p) => write!(f, "Grant::Packet({})", p.id()),
            ResourceGrant::Buffer(b) => {
                write!(f, "Grant::Buffer({} bytes)", b.capacity())
            }
            ResourceGrant::Chunks(c) => {
                write!(f, "Grant::Chunks({} chunks)", c.len())
            }
        }
    }
}

/// Completion callback fired when a request is granted
pub type AllocationCompletion = Box<dyn FnOnce(&ResourceRequest) + Send>;

const STATE_IDLE: u32 = 0;
const STATE_PENDING: u32 = 1;
const STATE_COMPLETE: u32 = 2;

/// An asynchronous allocation request.
///
/// Cloning is shallow; clones share the same underlying request, which is
/// how an allocator holds pending requests while the packet still embeds
/// one.
#[derive(Clone, Default)]
pub struct ResourceRequest {
    inner: Arc<RequestInner>,
}

#[derive(Default)]
struct RequestInner {
    state: AtomicU32,
    spec: Mutex<Option<(ResourceKind, usize)>>,
    grant: Mutex<Option<ResourceGrant>>,
    completion: Mutex<Option<AllocationCompletion>>,
    done: Mutex<bool>,
    condvar: Condvar,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe what to allocate. Legal only while idle.
    pub fn build(
        &self,
        kind: ResourceKind,
        count: usize,
        completion: Option<AllocationCompletion>,
    ) -> Result<()> {
        if self.inner.state.load(Ordering::Acquire) != STATE_IDLE {
            return Err(Error::AllocationInFlight);
        }
        *self.inner.spec.lock() = Some((kind, count));
        *self.inner.completion.lock() = completion;
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_PENDING
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_COMPLETE
    }

    /// Credits held by a granted-but-not-yet-taken allocation
    pub fn outstanding_credits(&self) -> u64 {
        self.inner
            .grant
            .lock()
            .as_ref()
            .map(ResourceGrant::credits)
            .unwrap_or(0)
    }

    /// Block until the request completes. For bring-up and tests.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.condvar.wait(&mut done);
        }
    }

    /// Take the granted resource, resetting the request for reuse
    pub fn take_grant(&self) -> Result<ResourceGrant> {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_COMPLETE,
                STATE_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AllocationIncomplete);
        }
        *self.inner.done.lock() = false;
        *self.inner.spec.lock() = None;
        self.inner
            .grant
            .lock()
            .take()
            .ok_or(Error::AllocationIncomplete)
    }

    fn spec(&self) -> Result<(ResourceKind, usize)> {
        (*self.inner.spec.lock()).ok_or(Error::AllocationIncomplete)
    }

    /// Allocator side: move to pending, exactly once per build
    fn mark_pending(&self) -> Result<()> {
        self.inner
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_PENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::AllocationInFlight)
    }

    /// Allocator side: deliver the grant and fire the completion, once
    fn complete_with(&self, grant: ResourceGrant) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_COMPLETE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            error!("allocation completed twice; grant dropped");
            return;
        }
        *self.inner.grant.lock() = Some(grant);
        let completion = self.inner.completion.lock().take();
        if let Some(callback) = completion {
            callback(self);
        }
        let mut done = self.inner.done.lock();
        *done = true;
        self.inner.condvar.notify_all();
    }
}

impl std::fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .field("spec", &*self.inner.spec.lock())
            .finish()
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// Source of packets, buffers and chunks
pub trait ResourceAllocator: Send + Sync {
    /// Submit a built request. Completion fires exactly once, possibly
    /// inline before this call returns.
    fn submit(&self, request: &ResourceRequest) -> Result<()>;

    /// Return a grant's resources to the allocator
    fn release(&self, grant: ResourceGrant);
}

/// Per-kind allocator counters, cache-line aligned to avoid false sharing
#[repr(C, align(64))]
#[derive(Debug, Default)]
struct AllocatorMetrics {
    packets_outstanding: AtomicU64,
    buffers_outstanding: AtomicU64,
    chunks_outstanding: AtomicU64,
    total_grants: AtomicU64,
    total_releases: AtomicU64,
    /// Padding to fill the cache line
    _padding: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<AllocatorMetrics>() <= 64);

impl AllocatorMetrics {
    fn credit_counter(&self, kind: ResourceKind) -> &AtomicU64 {
        match kind {
            ResourceKind::Packet => &self.packets_outstanding,
            ResourceKind::Buffer => &self.buffers_outstanding,
            ResourceKind::Chunks => &self.chunks_outstanding,
        }
    }
}

/// Point-in-time allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub chunks_total: usize,
    pub chunks_free: usize,
    pub pending_requests: usize,
    pub packets_outstanding: u64,
    pub buffers_outstanding: u64,
    pub chunks_outstanding: u64,
    pub total_grants: u64,
    pub total_releases: u64,
}

impl AllocatorStats {
    /// Credits held by callers across all kinds
    pub fn outstanding_credits(&self) -> u64 {
        self.packets_outstanding + self.buffers_outstanding + self.chunks_outstanding
    }
}

/// Fixed-pool allocator backing [`ResourceRequest`]s.
///
/// Buffer and chunk grants draw from a bounded chunk pool; packet grants
/// are heap-allocated but credit-tracked. Requests the pool cannot satisfy
/// immediately wait on a FIFO that is drained as grants are released.
pub struct PooledAllocator {
    free_chunks: Mutex<Vec<BytesMut>>,
    pending: Mutex<VecDeque<ResourceRequest>>,
    chunks_total: usize,
    metrics: AllocatorMetrics,
}

/// Configuration for a [`PooledAllocator`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of chunks backing buffer and chunk grants
    pub chunk_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { chunk_count: 64 }
    }
}

impl PooledAllocator {
    pub fn new(chunk_count: usize) -> Self {
        let free_chunks = (0..chunk_count)
            .map(|_| BytesMut::zeroed(CHUNK_SIZE))
            .collect();
        Self {
            free_chunks: Mutex::new(free_chunks),
            pending: Mutex::new(VecDeque::new()),
            chunks_total: chunk_count,
            metrics: AllocatorMetrics::default(),
        }
    }

    pub fn with_config(config: &PoolConfig) -> Self {
        Self::new(config.chunk_count)
    }

    /// Allocate immediately or fail; never queues
    pub fn try_allocate(
        &self,
        kind: ResourceKind,
        count: usize,
    ) -> Result<ResourceGrant> {
        self.try_grant(kind, count).ok_or_else(|| {
            let available = self.free_chunks.lock().len();
            Error::PoolExhausted {
                requested: count,
                available,
            }
        })
    }

    /// Build, submit, and wait; the synchronous bring-up path
    pub fn allocate_sync(
        &self,
        kind: ResourceKind,
        count: usize,
    ) -> Result<ResourceGrant> {
        let request = ResourceRequest::new();
        request.build(kind, count, None)?;
        self.submit(&request)?;
        request.wait();
        request.take_grant()
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            chunks_total: self.chunks_total,
            chunks_free: self.free_chunks.lock().len(),
            pending_requests: self.pending.lock().len(),
            packets_outstanding: self
                .metrics
                .packets_outstanding
                .load(Ordering::Acquire),
            buffers_outstanding: self
                .metrics
                .buffers_outstanding
                .load(Ordering::Acquire),
            chunks_outstanding: self
                .metrics
                .chunks_outstanding
                .load(Ordering::Acquire),
            total_grants: self.metrics.total_grants.load(Ordering::Acquire),
            total_releases: self.metrics.total_releases.load(Ordering::Acquire),
        }
    }

    fn try_grant(
        &self,
        kind: ResourceKind,
        count: usize,
    ) -> Option<ResourceGrant> {
        let grant = match kind {
            ResourceKind::Packet => {
                ResourceGrant::Packet(Box::new(Packet::new()))
            }
            ResourceKind::Buffer => {
                let chunk = self.free_chunks.lock().pop()?;
                ResourceGrant::Buffer(chunk)
            }
            ResourceKind::Chunks => {
                let mut pool = self.free_chunks.lock();
                if pool.len() < count {
                    return None;
                }
                let at = pool.len() - count;
                ResourceGrant::Chunks(pool.split_off(at))
            }
        };
        self.metrics
            .credit_counter(kind)
            .fetch_add(grant.credits(), Ordering::AcqRel);
        self.metrics.total_grants.fetch_add(1, Ordering::Relaxed);
        Some(grant)
    }

    /// Drain the pending FIFO as far as the pool allows. Completions fire
    /// outside the pool lock.
    fn drain_pending(&self) {
        loop {
            let granted = {
                let mut pending = self.pending.lock();
                let Some(request) = pending.front() else {
                    return;
                };
                let Ok((kind, count)) = request.spec() else {
                    // Malformed entry; drop it and keep draining
                    pending.pop_front();
                    continue;
                };
                match self.try_grant(kind, count) {
                    Some(grant) => pending.pop_front().map(|r| (r, grant)),
                    // Head of line still blocked; stop to preserve FIFO
                    None => return,
                }
            };
            if let Some((request, grant)) = granted {
                request.complete_with(grant);
            }
        }
    }
}

impl ResourceAllocator for PooledAllocator {
    fn submit(&self, request: &ResourceRequest) -> Result<()> {
        let (kind, count) = request.spec()?;
        request.mark_pending()?;
        // Queue first so releases racing with us cannot starve the FIFO
        let inline = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                match self.try_grant(kind, count) {
                    Some(grant) => Some(grant),
                    None => {
                        debug!(?kind, count, "allocation deferred");
                        pending.push_back(request.clone());
                        None
                    }
                }
            } else {
                pending.push_back(request.clone());
                None
            }
        };
        if let Some(grant) = inline {
            request.complete_with(grant);
        }
        Ok(())
    }

    fn release(&self, grant: ResourceGrant) {
        let credits = grant.credits();
        let kind = grant.kind();
        match grant {
            ResourceGrant::Packet(_) => {}
            ResourceGrant::Buffer(chunk) => {
                self.free_chunks.lock().push(chunk);
            }
            ResourceGrant::Chunks(chunks) => {
                self.free_chunks.lock().extend(chunks);
            }
        }
        self.metrics
            .credit_counter(kind)
            .fetch_sub(credits, Ordering::AcqRel);
        self.metrics.total_releases.fetch_add(1, Ordering::Relaxed);
        self.drain_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_inline_grant_when_pool_has_room() {
        let allocator = PooledAllocator::new(4);
        let request = ResourceRequest::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let completion_fired = Arc::clone(&fired);
        request
            .build(
                ResourceKind::Chunks,
                2,
                Some(Box::new(move |_r| {
                    completion_fired.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        allocator.submit(&request).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(request.is_complete());

        let grant = request.take_grant().unwrap();
        assert_eq!(grant.credits(), 2);
        assert_eq!(allocator.stats().chunks_free, 2);
        allocator.release(grant);
        assert_eq!(allocator.stats().chunks_free, 4);
        assert_eq!(allocator.stats().outstanding_credits(), 0);
    }

    #[test]
    fn test_deferred_grant_completes_on_release() {
        let allocator = PooledAllocator::new(2);
        let held = allocator.try_allocate(ResourceKind::Chunks, 2).unwrap();

        let request = ResourceRequest::new();
        request.build(ResourceKind::Buffer, 1, None).unwrap();
        allocator.submit(&request).unwrap();
        assert!(request.is_pending());
        assert_eq!(allocator.stats().pending_requests, 1);

        allocator.release(held);
        assert!(request.is_complete());
        let grant = request.take_grant().unwrap();
        assert_eq!(grant.kind(), ResourceKind::Buffer);
        allocator.release(grant);
    }

    #[test]
    fn test_pending_fifo_order_preserved() {
        let allocator = PooledAllocator::new(1);
        let held = allocator.try_allocate(ResourceKind::Buffer, 1).unwrap();

        let first = ResourceRequest::new();
        first.build(ResourceKind::Buffer, 1, None).unwrap();
        allocator.submit(&first).unwrap();
        let second = ResourceRequest::new();
        second.build(ResourceKind::Buffer, 1, None).unwrap();
        allocator.submit(&second).unwrap();

        allocator.release(held);
        assert!(first.is_complete());
        assert!(second.is_pending());
        allocator.release(first.take_grant().unwrap());
        assert!(second.is_complete());
    }

    #[test]
    fn test_try_allocate_fails_fast() {
        let allocator = PooledAllocator::new(1);
        let err = allocator.try_allocate(ResourceKind::Chunks, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::PoolExhausted {
                requested: 3,
                available: 1
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_double_submit_rejected() {
        let allocator = PooledAllocator::new(0);
        let request = ResourceRequest::new();
        request.build(ResourceKind::Buffer, 1, None).unwrap();
        allocator.submit(&request).unwrap();
        assert!(matches!(
            allocator.submit(&request),
            Err(Error::AllocationInFlight)
        ));
        assert!(matches!(
            request.build(ResourceKind::Buffer, 1, None),
            Err(Error::AllocationInFlight)
        ));
    }

    #[test]
    fn test_take_before_complete_rejected() {
        let request = ResourceRequest::new();
        request.build(ResourceKind::Buffer, 1, None).unwrap();
        assert!(matches!(
            request.take_grant(),
            Err(Error::AllocationIncomplete)
        ));
    }

    #[test]
    fn test_allocate_sync_round_trip() {
        let allocator = PooledAllocator::new(2);
        let grant = allocator
            .allocate_sync(ResourceKind::Packet, 1)
            .unwrap();
        assert_eq!(grant.kind(), ResourceKind::Packet);
        assert_eq!(allocator.stats().packets_outstanding, 1);
        assert_eq!(allocator.stats().outstanding_credits(), 1);
        allocator.release(grant);
        assert_eq!(allocator.stats().outstanding_credits(), 0);
    }

    #[test]
    fn test_packet_reclaim_blocked_by_held_grant() {
        let allocator = PooledAllocator::new(2);
        let mut packet = Packet::new();
        packet
            .resource_request()
            .build(ResourceKind::Buffer, 1, None)
            .unwrap();
        allocator.submit(packet.resource_request()).unwrap();
        assert!(matches!(
            packet.check_reclaimable(),
            Err(Error::OutstandingCredits { credits: 1 })
        ));
        let grant = packet.resource_request().take_grant().unwrap();
        assert!(packet.check_reclaimable().is_ok());
        assert!(packet.reuse().is_ok());
        allocator.release(grant);
    }
}
