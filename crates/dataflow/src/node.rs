//! The node protocol.
//!
//! A node is one shared segment plus its barriers: a single write
//! semaphore and one read semaphore per source slot. Each published
//! sample traverses one full handshake:
//!
//! - the sink waits on the write barrier once per slot it notified for
//!   the previous sample, which is exactly when every outstanding source
//!   critical section has ended;
//! - the sink mutates the payload, bumps the sample number (release) and
//!   posts each attached slot's read barrier once;
//! - each source waits on its own read barrier, reads the payload, then
//!   posts the write barrier.
//!
//! Per-slot read barriers keep delivery exactly-once under dynamic
//! membership: a source attaching at sample N is simply absent from the
//! post batch of sample N and present from N+1 on. Membership changes and
//! barrier posting are serialized by the in-header spin lock, so a slot
//! is never notified and vacated concurrently.

use crate::errors::NodeError;
use crate::header::{self, NodeHeader};
use crate::names::{self, NodeConfig};
use crate::segment::Segment;
use crate::semaphore::{Semaphore, SemaphoreError};
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Outcome of a blocking endpoint operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The node is live; for a source wait, a fresh sample is held.
    Live,
    /// The sink has departed; the stream is over.
    End,
}

/// Membership mode, declared by the sink at bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachPolicy {
    /// Sources may come and go mid-stream; late joiners first observe the
    /// next published sample.
    #[default]
    Dynamic = 0,
    /// Membership is fixed once streaming starts; attaches after the
    /// first publish are refused.
    Static = 1,
}

/// A source's reserved index inside the node's barrier accounting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SourceSlot {
    pub index: u32,
    pub generation: u32,
    /// Head sample number at attach time; samples at or before it belong
    /// to earlier members.
    pub joined_at: u64,
}

pub(crate) struct Node {
    segment: Segment,
    write_sem: Semaphore,
    read_sems: RefCell<Vec<Option<Semaphore>>>,
}

impl Node {
    pub fn open(cfg: &NodeConfig, name: &str) -> Result<Self, NodeError> {
        let segment = Segment::open_or_create(cfg, name)?;
        let write_sem = Semaphore::ensure(&names::write_sem_name(name), 0)?;

        let mut read_sems = Vec::with_capacity(header::SLOT_CAP);
        read_sems.resize_with(header::SLOT_CAP, || None);

        Ok(Self {
            segment,
            write_sem,
            read_sems: RefCell::new(read_sems),
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn header(&self) -> &NodeHeader {
        self.segment.header()
    }

    pub fn sample_number(&self) -> u64 {
        self.header().sample_number.load(Ordering::Acquire)
    }

    pub fn sink_state(&self) -> u16 {
        self.header().sink_state.load(Ordering::Acquire)
    }

    /// Run `op` against a slot's read barrier, opening it on first use.
    fn with_read_sem<R>(
        &self,
        slot: u32,
        op: impl FnOnce(&Semaphore) -> Result<R, SemaphoreError>,
    ) -> Result<R, NodeError> {
        let mut sems = self.read_sems.borrow_mut();
        let entry = &mut sems[slot as usize];
        if entry.is_none() {
            let sem_name = names::read_sem_name(self.segment.name(), slot);
            *entry = Some(Semaphore::ensure(&sem_name, 0)?);
        }
        match entry {
            Some(sem) => Ok(op(sem)?),
            None => unreachable!("slot semaphore ensured above"),
        }
    }

    fn attached_slots(mask: u32) -> impl Iterator<Item = u32> {
        (0..header::SLOT_CAP as u32).filter(move |i| mask & (1 << i) != 0)
    }

    // ---------------------------------------------------------------- sink

    /// Claim the node's sink side and declare the payload.
    ///
    /// Exclusive: a second bind fails with `AlreadyBound`. A node left in
    /// END with no attached sources by an unclean shutdown is recycled.
    pub fn bind_as_sink(
        &mut self,
        payload_bytes: u64,
        params: &[u8; header::PARAMS_BYTES],
        policy: AttachPolicy,
    ) -> Result<(), NodeError> {
        if payload_bytes == 0 {
            return Err(NodeError::ZeroPayload);
        }
        self.segment
            .ensure_len(header::PAYLOAD_OFFSET as u64 + payload_bytes)?;

        let header = self.segment.header();
        let _guard = header.lock();

        match header.sink_state.load(Ordering::Acquire) {
            header::sink_state::UNDEFINED => {}
            header::sink_state::END
                if header.source_ref_count.load(Ordering::Relaxed) == 0 =>
            {
                header.sample_number.store(0, Ordering::Relaxed);
            }
            _ => return Err(NodeError::AlreadyBound(self.segment.name().to_string())),
        }

        // Stale counts from a previous stream must not satisfy our first
        // publish_begin.
        self.write_sem.drain()?;

        header.payload_bytes.store(payload_bytes, Ordering::Relaxed);
        unsafe { header.write_params(params) };
        header.attach_policy.store(policy as u32, Ordering::Relaxed);
        header
            .sink_state
            .store(header::sink_state::BOUND, Ordering::Release);

        tracing::info!(node = self.segment.name(), payload_bytes, "sink bound node");
        Ok(())
    }

    /// Enter the sink critical section: absorb one write-barrier count per
    /// slot notified for the previous sample. Returns `false` if `timeout`
    /// elapsed first (with `outstanding` reflecting the remainder).
    pub fn publish_begin(
        &mut self,
        outstanding: &mut u32,
        timeout: Option<Duration>,
    ) -> Result<bool, NodeError> {
        while *outstanding > 0 {
            match timeout {
                None => self.write_sem.wait()?,
                Some(limit) => {
                    if !self.write_sem.wait_timeout(limit)? {
                        return Ok(false);
                    }
                }
            }
            *outstanding -= 1;
        }
        Ok(true)
    }

    /// Leave the sink critical section: advance the sample number and
    /// notify every attached slot. Returns the new sample number and the
    /// number of slots notified.
    pub fn publish_end(&mut self) -> Result<(u64, u32), NodeError> {
        let header = self.segment.header();
        let sample = header.sample_number.load(Ordering::Relaxed) + 1;

        let _guard = header.lock();
        let mask = header.slot_mask.load(Ordering::Relaxed);
        // Payload writes happen-before this store; consumers pair it with
        // an acquire load after their barrier wait.
        header.sample_number.store(sample, Ordering::Release);

        let mut posted = 0;
        for slot in Self::attached_slots(mask) {
            self.with_read_sem(slot, |sem| sem.post())?;
            posted += 1;
        }

        Ok((sample, posted))
    }

    /// Evict every attached slot still holding the current sample.
    ///
    /// Used by the sink after a publish wait timed out; each evicted
    /// slot's barrier contribution is reset and its generation bumped so
    /// the abandoned source observes `SlotReclaimed`. Returns the number
    /// of slots evicted.
    pub fn reclaim_stalled(&mut self, outstanding: &mut u32) -> Result<u32, NodeError> {
        let header = self.segment.header();
        let _guard = header.lock();

        let head = header.sample_number.load(Ordering::Relaxed);
        let mask = header.slot_mask.load(Ordering::Relaxed);
        let mut evicted = 0;

        for slot in Self::attached_slots(mask) {
            let record = self.segment.slot(slot);
            if record.released.load(Ordering::Acquire) >= head {
                continue;
            }

            header.slot_mask.fetch_and(!(1 << slot), Ordering::Relaxed);
            header.source_ref_count.fetch_sub(1, Ordering::Relaxed);
            record.generation.fetch_add(1, Ordering::Release);
            // The undelivered notification, if any, no longer has a taker.
            self.with_read_sem(slot, |sem| sem.drain())?;

            *outstanding = outstanding.saturating_sub(1);
            evicted += 1;
            tracing::warn!(node = self.segment.name(), slot, "reclaimed stalled slot");
        }

        Ok(evicted)
    }

    /// Declare END and wake every attached source.
    pub fn end_stream(&mut self) -> Result<(), NodeError> {
        let header = self.segment.header();
        let _guard = header.lock();

        header
            .sink_state
            .store(header::sink_state::END, Ordering::Release);

        let mask = header.slot_mask.load(Ordering::Relaxed);
        for slot in Self::attached_slots(mask) {
            self.with_read_sem(slot, |sem| sem.post())?;
        }

        tracing::info!(node = self.segment.name(), "sink declared end of stream");
        Ok(())
    }

    // -------------------------------------------------------------- source

    /// Reserve a source slot.
    pub fn attach_source(&mut self) -> Result<SourceSlot, NodeError> {
        let header = self.segment.header();
        let _guard = header.lock();

        let max_sources = header.max_sources.load(Ordering::Relaxed);
        let mask = header.slot_mask.load(Ordering::Relaxed);

        if mask.count_ones() >= max_sources {
            return Err(NodeError::Saturated(max_sources));
        }

        let head = header.sample_number.load(Ordering::Relaxed);
        let is_static =
            header.attach_policy.load(Ordering::Relaxed) == AttachPolicy::Static as u32;
        if is_static && head > 0 {
            return Err(NodeError::AttachClosed);
        }

        let index = mask.trailing_ones();
        debug_assert!(index < header::SLOT_CAP as u32);

        header.slot_mask.store(mask | (1 << index), Ordering::Relaxed);
        header.source_ref_count.fetch_add(1, Ordering::Relaxed);

        let record = self.segment.slot(index);
        record.released.store(head, Ordering::Relaxed);
        let generation = record.generation.load(Ordering::Relaxed);

        // A previous tenant of this slot may have left counts behind.
        self.with_read_sem(index, |sem| sem.drain())?;

        tracing::info!(node = self.segment.name(), slot = index, "source attached");
        Ok(SourceSlot {
            index,
            generation,
            joined_at: head,
        })
    }

    fn check_slot(&self, slot: &SourceSlot) -> Result<(), NodeError> {
        let current = self
            .segment
            .slot(slot.index)
            .generation
            .load(Ordering::Acquire);
        if current != slot.generation {
            return Err(NodeError::SlotReclaimed);
        }
        Ok(())
    }

    /// Enter the source critical section. Blocks until the sink publishes
    /// a sample newer than `last_seen` or declares END.
    pub fn consume_begin(
        &mut self,
        slot: &SourceSlot,
        last_seen: &mut u64,
    ) -> Result<NodeState, NodeError> {
        self.check_slot(slot)?;

        // END with nothing newer pending means the stream has drained for
        // this slot; do not touch the barrier again.
        if self.sink_state() == header::sink_state::END && self.sample_number() == *last_seen {
            return Ok(NodeState::End);
        }

        self.with_read_sem(slot.index, |sem| sem.wait())?;
        self.check_slot(slot)?;

        let sample = self.sample_number();
        if sample == *last_seen {
            // Woken by the END broadcast, not by data.
            return Ok(NodeState::End);
        }

        debug_assert_eq!(
            sample,
            *last_seen + 1,
            "slot {} skipped a sample",
            slot.index
        );
        *last_seen = sample;
        Ok(NodeState::Live)
    }

    /// Leave the source critical section: record the release and credit
    /// the sink's write barrier.
    pub fn consume_end(&mut self, slot: &SourceSlot, last_seen: u64) -> Result<(), NodeError> {
        self.check_slot(slot)?;
        self.segment
            .slot(slot.index)
            .released
            .store(last_seen, Ordering::Release);
        self.write_sem.post()?;
        Ok(())
    }

    /// Give the slot back. Undelivered sample notifications are drained
    /// and credited so the sink never waits on a departed source.
    pub fn detach_source(&mut self, slot: &SourceSlot) -> Result<(), NodeError> {
        let header = self.segment.header();
        let guard = header.lock();

        let record = self.segment.slot(slot.index);
        if record.generation.load(Ordering::Relaxed) != slot.generation {
            // Already reclaimed; nothing is ours to return.
            return Ok(());
        }

        header
            .slot_mask
            .fetch_and(!(1 << slot.index), Ordering::Relaxed);
        header.source_ref_count.fetch_sub(1, Ordering::Relaxed);
        record.generation.fetch_add(1, Ordering::Release);

        let ended = header.sink_state.load(Ordering::Acquire) == header::sink_state::END;
        let drained = self.with_read_sem(slot.index, |sem| sem.drain())?;
        if !ended {
            for _ in 0..drained {
                self.write_sem.post()?;
            }
        }

        let last_out = ended && header.source_ref_count.load(Ordering::Relaxed) == 0;
        drop(guard);

        tracing::info!(node = self.segment.name(), slot = slot.index, "source detached");
        if last_out {
            self.cleanup();
        }
        Ok(())
    }

    /// Try to finish connecting: Ok once the node is BOUND or END, Err
    /// while the sink has not arrived (pollable via `wait_for_resource`).
    pub fn bound_state(&self) -> Result<NodeState, NodeError> {
        match self.sink_state() {
            header::sink_state::BOUND => Ok(NodeState::Live),
            header::sink_state::END => Ok(NodeState::End),
            _ => Err(NodeError::NotBound(self.segment.name().to_string())),
        }
    }

    /// Extend the local mapping over the payload region declared by the
    /// sink. Call after BOUND is observed.
    pub fn map_payload(&mut self, required: usize) -> Result<(), NodeError> {
        let declared = self.header().payload_bytes.load(Ordering::Acquire);
        if declared < required as u64 {
            return Err(NodeError::TooSmall {
                name: self.segment.name().to_string(),
                have: declared,
                need: required as u64,
            });
        }
        self.segment
            .ensure_len(header::PAYLOAD_OFFSET as u64 + declared)?;
        if (self.segment.mapped_payload_bytes() as u64) < declared {
            return Err(NodeError::TooSmall {
                name: self.segment.name().to_string(),
                have: self.segment.mapped_payload_bytes() as u64,
                need: declared,
            });
        }
        Ok(())
    }

    pub fn params_block(&self) -> [u8; header::PARAMS_BYTES] {
        self.header().read_params()
    }

    pub fn payload_ptr(&self) -> *mut u8 {
        self.segment.payload_ptr()
    }

    pub fn source_count(&self) -> u32 {
        self.header().source_ref_count.load(Ordering::Relaxed)
    }

    /// Remove the segment and every derived semaphore. Called by whichever
    /// endpoint observes the drain (sink END with zero sources attached).
    pub fn cleanup(&mut self) {
        tracing::debug!(node = self.segment.name(), "removing drained node");
        self.segment.remove();
        if let Err(e) = Semaphore::unlink(&names::write_sem_name(self.segment.name())) {
            tracing::debug!("write barrier unlink: {e}");
        }
        for slot in 0..header::SLOT_CAP as u32 {
            let _ = Semaphore::unlink(&names::read_sem_name(self.segment.name(), slot));
        }
    }

    /// Sink-side drain check, run on sink departure after END is posted.
    pub fn cleanup_if_drained(&mut self) {
        let drained = {
            let header = self.segment.header();
            let _guard = header.lock();
            header.source_ref_count.load(Ordering::Relaxed) == 0
        };
        if drained {
            self.cleanup();
        }
    }
}
