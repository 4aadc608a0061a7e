//! Sub-request Fan-out / Fan-in
//!
//! A master packet that must be split across several destinations parks
//! itself in a [`FanOut`] and spawns sub-request packets against it. Each
//! sub-request inherits a defined flag subset, the master's priority, core
//! affinity and deadline. As sub-requests finish, their statuses are merged
//! by error precedence; the caller that retires the final sub-request gets
//! the master back, exactly once, carrying the merged status.
//!
//! ```text
//!            ┌── sub 0 ──▶ status ─┐
//!   master ──┼── sub 1 ──▶ status ─┼─ merge ──▶ master reclaimed by
//!            └── sub 2 ──▶ status ─┘            the last finisher
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::packet::flags::PacketFlags;
use crate::packet::packet::{Packet, PacketId};
use crate::packet::state::PacketStatus;

/// Parking place for a master packet split into sub-requests
pub struct FanOut {
    master: Mutex<Option<Packet>>,
    outstanding: AtomicUsize,
    merged_status: Mutex<PacketStatus>,
    children: Mutex<Vec<PacketId>>,
    master_control: Arc<crate::packet::state::PacketControl>,
    master_flags: PacketFlags,
    master_priority: crate::packet::packet::PacketPriority,
    master_core: Option<usize>,
    master_deadline_ms: u64,
}

impl FanOut {
    /// Park a master packet and return the shared fan-out handle
    pub fn new(master: Packet) -> Arc<Self> {
        let master_control = master.control();
        let master_flags = master.flags();
        Arc::new(Self {
            master_flags,
            master_priority: master.priority(),
            master_core: master.core_id(),
            master_deadline_ms: master.expiration_time_ms(),
            master_control,
            master: Mutex::new(Some(master)),
            outstanding: AtomicUsize::new(0),
            merged_status: Mutex::new(PacketStatus::INVALID),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Attach a sub-request. The child inherits the master's inheritable
    /// flags, priority, core affinity and deadline. Rejected if the master
    /// has already been canceled.
    pub fn add_subpacket(
        self: &Arc<Self>,
        child: &mut Packet,
    ) -> Result<()> {
        if self.master_control.is_canceled() {
            debug!(child = child.id(), "sub-request rejected, master canceled");
            return Err(Error::MasterCanceled);
        }
        if child.master().is_some() {
            return Err(Error::MasterStillLinked);
        }
        child.set_flags(self.master_flags & PacketFlags::INHERITABLE);
        child.set_priority(self.master_priority);
        if let Some(core) = self.master_core {
            child.set_core_id(core);
        }
        if self.master_deadline_ms != 0 {
            child.set_expiration_time_ms(self.master_deadline_ms);
        }
        child.link_master(Arc::clone(self));
        self.children.lock().push(child.id());
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Retire a finished sub-request.
    ///
    /// Unlinks the child, merges its status into the accumulated master
    /// status, and decrements the outstanding count. The caller retiring
    /// the last sub-request receives the master packet, already stamped
    /// with the merged status, and is expected to complete it.
    pub fn child_completed(
        self: &Arc<Self>,
        child: &mut Packet,
    ) -> Result<Option<Packet>> {
        self.unlink(child)?;
        {
            let mut merged = self.merged_status.lock();
            *merged = merged.merge(child.status());
        }
        self.retire_one()
    }

    /// Detach a sub-request without merging its status, for abort paths
    pub fn remove_subpacket(
        self: &Arc<Self>,
        child: &mut Packet,
    ) -> Result<Option<Packet>> {
        self.unlink(child)?;
        self.retire_one()
    }

    /// Forcibly reclaim the parked master, e.g. when fan-out setup failed
    /// before any sub-request was attached.
    pub fn take_master(&self) -> Result<Packet> {
        let outstanding = self.outstanding.load(Ordering::Acquire);
        if outstanding != 0 {
            return Err(Error::SubpacketsOutstanding {
                remaining: outstanding,
            });
        }
        self.master.lock().take().ok_or(Error::NoMasterPacket)
    }

    /// Sub-requests still in flight
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Ids of currently attached sub-requests, for diagnostics
    pub fn subpacket_ids(&self) -> Vec<PacketId> {
        self.children.lock().clone()
    }

    fn unlink(self: &Arc<Self>, child: &mut Packet) -> Result<()> {
        match child.unlink_master() {
            Some(master) if Arc::ptr_eq(&master, self) => {
                self.children.lock().retain(|id| *id != child.id());
                Ok(())
            }
            Some(master) => {
                // Child belongs to a different fan-out; restore the link
                child.link_master(master);
                Err(Error::NoMasterPacket)
            }
            None => Err(Error::NoMasterPacket),
        }
    }

    fn retire_one(&self) -> Result<Option<Packet>> {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Underflow; restore and report
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            error!("sub-request retired with none outstanding");
            return Err(Error::NoMasterPacket);
        }
        if previous != 1 {
            return Ok(None);
        }
        let mut master = self
            .master
            .lock()
            .take()
            .ok_or(Error::DoubleCompletion)?;
        let merged = *self.merged_status.lock();
        if merged != PacketStatus::INVALID {
            master.set_status(merged);
        }
        Ok(Some(master))
    }
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("outstanding", &self.outstanding())
            .field("merged_status", &*self.merged_status.lock())
            .field("parked", &self.master.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::state::StatusCode;
    use std::sync::atomic::AtomicUsize;

    fn started_packet() -> Packet {
        let mut packet = Packet::new();
        packet.start().unwrap();
        packet
    }

    #[test]
    fn test_flags_priority_and_deadline_inherited() {
        let mut master = started_packet();
        master.set_flags(
            PacketFlags::MONITOR_OP
                | PacketFlags::DO_NOT_QUIESCE
                | PacketFlags::SYNC,
        );
        master.set_priority(crate::packet::packet::PacketPriority::Urgent);
        master.set_core_id(2);
        master.set_expiration_time_ms(12_345);
        let fanout = FanOut::new(master);

        let mut child = started_packet();
        fanout.add_subpacket(&mut child).unwrap();
        assert!(child.flags().contains(PacketFlags::MONITOR_OP));
        assert!(child.flags().contains(PacketFlags::DO_NOT_QUIESCE));
        assert!(!child.flags().contains(PacketFlags::SYNC));
        assert_eq!(
            child.priority(),
            crate::packet::packet::PacketPriority::Urgent
        );
        assert_eq!(child.core_id(), Some(2));
        assert_eq!(child.expiration_time_ms(), 12_345);
        assert_eq!(fanout.outstanding(), 1);
        assert_eq!(fanout.subpacket_ids(), vec![child.id()]);
    }

    #[test]
    fn test_last_child_returns_master_with_merged_status() {
        let fanout = FanOut::new(started_packet());
        let mut a = started_packet();
        let mut b = started_packet();
        fanout.add_subpacket(&mut a).unwrap();
        fanout.add_subpacket(&mut b).unwrap();

        a.set_status(PacketStatus::ok());
        assert!(fanout.child_completed(&mut a).unwrap().is_none());
        assert!(a.master().is_none());

        b.set_status(PacketStatus::new(StatusCode::Failed, 9));
        let master = fanout.child_completed(&mut b).unwrap().unwrap();
        // Failure outranks success in the merge
        assert_eq!(master.status().code, StatusCode::Failed);
        assert_eq!(master.status().qualifier, 9);
    }

    #[test]
    fn test_all_ok_children_leave_master_ok() {
        let fanout = FanOut::new(started_packet());
        let mut a = started_packet();
        let mut b = started_packet();
        fanout.add_subpacket(&mut a).unwrap();
        fanout.add_subpacket(&mut b).unwrap();
        a.set_status(PacketStatus::ok());
        b.set_status(PacketStatus::ok());
        fanout.child_completed(&mut a).unwrap();
        let master = fanout.child_completed(&mut b).unwrap().unwrap();
        assert_eq!(master.status().code, StatusCode::Ok);
    }

    #[test]
    fn test_canceled_master_rejects_new_subpackets() {
        let master = started_packet();
        let control = master.control();
        let fanout = FanOut::new(master);
        control.cancel();

        let mut child = started_packet();
        let err = fanout.add_subpacket(&mut child).unwrap_err();
        assert!(matches!(err, Error::MasterCanceled));
        assert!(child.master().is_none());
    }

    #[test]
    fn test_unlinked_child_is_rejected() {
        let fanout = FanOut::new(started_packet());
        let mut stranger = started_packet();
        assert!(matches!(
            fanout.child_completed(&mut stranger),
            Err(Error::NoMasterPacket)
        ));
    }

    #[test]
    fn test_take_master_requires_empty_fanout() {
        let fanout = FanOut::new(started_packet());
        let mut child = started_packet();
        fanout.add_subpacket(&mut child).unwrap();
        assert!(matches!(
            fanout.take_master(),
            Err(Error::SubpacketsOutstanding { remaining: 1 })
        ));
        fanout.remove_subpacket(&mut child).unwrap();
        // remove_subpacket of the last child already reclaimed the master
        assert!(matches!(fanout.take_master(), Err(Error::NoMasterPacket)));
    }

    #[test]
    fn test_concurrent_fan_in_reclaims_master_exactly_once() {
        for _ in 0..50 {
            let threads = 4;
            let per_thread = 8;
            let mut master = started_packet();
            let reclaims = Arc::new(AtomicUsize::new(0));
            let total = Arc::clone(&reclaims);
            master
                .set_completion(Box::new(move |_p| {
                    total.fetch_add(1, Ordering::SeqCst);
                    crate::packet::completion::CompletionDisposition::Continue
                }))
                .unwrap();
            let fanout = FanOut::new(master);

            let mut children: Vec<Vec<Packet>> = Vec::new();
            for _ in 0..threads {
                let mut batch = Vec::new();
                for _ in 0..per_thread {
                    let mut child = started_packet();
                    fanout.add_subpacket(&mut child).unwrap();
                    batch.push(child);
                }
                children.push(batch);
            }

            let handles: Vec<_> = children
                .into_iter()
                .map(|batch| {
                    let fanout = Arc::clone(&fanout);
                    std::thread::spawn(move || {
                        for mut child in batch {
                            child.set_status(PacketStatus::ok());
                            if let Some(mut master) =
                                fanout.child_completed(&mut child).unwrap()
                            {
                                master.complete().unwrap();
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(fanout.outstanding(), 0);
            assert_eq!(reclaims.load(Ordering::SeqCst), 1);
        }
    }
}
