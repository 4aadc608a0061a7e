//! Service Queue
//!
//! A FIFO of parked packets. Enqueue and dequeue are the two places a
//! packet's lifecycle state flips between `InProgress` and `Queued`, and
//! both sides have to cope with a canceler that fired in between.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::flags::PacketFlags;
use crate::packet::packet::{Packet, PacketId};
use crate::packet::state::{PacketState, PacketStatus, StatusCode};

/// FIFO queue of packets owned by a service
#[derive(Debug, Default)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<Packet>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a packet. The state exchange observes a concurrent cancel:
    /// if the packet was already marked canceled, the cancel status is
    /// recorded so the eventual dequeuer sees it.
    pub fn enqueue(&self, mut packet: Packet) -> Result<()> {
        if packet.on_queue {
            return Err(Error::AlreadyQueued);
        }
        let control = packet.control();
        match control.exchange_state(PacketState::Queued) {
            PacketState::InProgress => {}
            PacketState::Canceled => {
                // Canceler won the race; keep the mark and park anyway,
                // dequeue will surface it.
                if !control.flags().contains(PacketFlags::DO_NOT_CANCEL) {
                    control.set_status(PacketStatus::new(
                        StatusCode::CancelPending,
                        0,
                    ));
                }
                control.exchange_state(PacketState::Canceled);
                debug!(packet = packet.id(), "enqueued an already-canceled packet");
            }
            other => {
                warn!(
                    packet = packet.id(),
                    state = ?other,
                    "enqueue from unexpected state"
                );
            }
        }
        packet.on_queue = true;
        self.inner.lock().push_back(packet);
        Ok(())
    }

    /// Pop the oldest packet and return it to the `InProgress` state.
    /// A packet canceled while parked keeps its canceled mark.
    pub fn dequeue(&self) -> Option<Packet> {
        let mut packet = self.inner.lock().pop_front()?;
        self.restore_in_progress(&mut packet);
        Some(packet)
    }

    /// Remove a specific packet by id
    pub fn remove(&self, id: PacketId) -> Result<Packet> {
        let mut queue = self.inner.lock();
        let position = queue
            .iter()
            .position(|p| p.id() == id)
            .ok_or(Error::NotQueued)?;
        let mut packet = queue.remove(position).ok_or(Error::NotQueued)?;
        drop(queue);
        self.restore_in_progress(&mut packet);
        Ok(packet)
    }

    /// Drain every parked packet, oldest first
    pub fn drain(&self) -> Vec<Packet> {
        let mut queue = self.inner.lock();
        let mut out = Vec::with_capacity(queue.len());
        while let Some(mut packet) = queue.pop_front() {
            self.restore_in_progress(&mut packet);
            out.push(packet);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn restore_in_progress(&self, packet: &mut Packet) {
        packet.on_queue = false;
        let control = packet.control();
        match control.exchange_state(PacketState::InProgress) {
            PacketState::Queued => {
                // Clean hand-back; a stale cancel hook no longer applies
                control.clear_cancel_hook();
            }
            PacketState::Canceled => {
                // Canceled while parked; restore the mark for the new owner
                control.exchange_state(PacketState::Canceled);
                if !control.flags().contains(PacketFlags::DO_NOT_CANCEL) {
                    control.set_status(PacketStatus::new(
                        StatusCode::CancelPending,
                        0,
                    ));
                }
                packet.record_canceled();
            }
            other => {
                warn!(
                    packet = packet.id(),
                    state = ?other,
                    "dequeue from unexpected state"
                );
            }
        }
    }
}
