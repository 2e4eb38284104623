//! Ring buffer slots and the free/rt slot queues
//!
//! Disk I/O and the realtime thread exchange audio through fixed-size
//! planar buffer slots travelling around a pair of single-producer
//! single-consumer queues:
//!
//! - `free`: empty slots waiting for the filling side
//! - `rt`: full slots waiting for the consuming side
//!
//! For a read source, disk I/O fills and the realtime thread consumes; for
//! a write source the roles mirror. A slot is owned by exactly one queue,
//! or transiently by the side that just popped it; the total number of
//! slots is fixed when the ring is allocated. Queue push/pop are the only
//! synchronization: the enqueue is the release point for the slot's
//! content, the dequeue the acquire point.
//!
//! Queue ops are wait-free (`try_push`/`try_pop`); overflow cannot happen
//! as long as every popped slot is pushed back to the opposite queue, so a
//! failed push is a programming error, not a runtime condition.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use travada_common::TimeRef;

/// Default number of slots per source ring.
pub const DEFAULT_SLOT_COUNT: usize = 50;

/// Sync classification of a source's ring, shared between the realtime
/// and disk threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncStatus {
    /// Ring allocated but never primed
    Unknown = 0,
    /// Realtime demand does not match the queued slots; disk must re-seek
    OutOfSync = 1,
    /// Disk is repositioning the reader towards the demanded location
    QueueSeeking = 2,
    /// First slot at the demanded location is queued
    QueueSeeked = 3,
    /// Slots flow contiguously; audible samples are produced
    InSync = 4,
    /// Disk could not obtain a free slot; realtime renders silence
    FillDequeueFailure = 5,
    /// Realtime could not return a slot to the free queue
    FillEnqueueFailure = 6,
}

impl SyncStatus {
    fn from_u8(v: u8) -> SyncStatus {
        match v {
            1 => SyncStatus::OutOfSync,
            2 => SyncStatus::QueueSeeking,
            3 => SyncStatus::QueueSeeked,
            4 => SyncStatus::InSync,
            5 => SyncStatus::FillDequeueFailure,
            6 => SyncStatus::FillEnqueueFailure,
            _ => SyncStatus::Unknown,
        }
    }
}

/// Shared fill/sync bookkeeping for one source.
///
/// Both sides read and write these atomically; nothing else about a source
/// is shared between the realtime and disk threads.
#[derive(Debug)]
pub struct BufferStatus {
    sync: AtomicU8,
    fill_percent: AtomicU8,
    priority: AtomicU32,
    /// Universal-sample location the realtime side last demanded.
    /// Written before the sync status flips to `OutOfSync` (release), read
    /// by disk I/O after observing the flip (acquire).
    demand: AtomicI64,
    /// Number of OutOfSync transitions; polled by the control thread for
    /// event reporting. Never read on the audio path.
    sync_losses: AtomicU64,
}

impl BufferStatus {
    pub fn new() -> Self {
        BufferStatus {
            sync: AtomicU8::new(SyncStatus::OutOfSync as u8),
            fill_percent: AtomicU8::new(0),
            priority: AtomicU32::new(1),
            demand: AtomicI64::new(TimeRef::INVALID.universal()),
            sync_losses: AtomicU64::new(0),
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus::from_u8(self.sync.load(Ordering::Acquire))
    }

    pub fn set_sync_status(&self, status: SyncStatus) {
        self.sync.store(status as u8, Ordering::Release);
    }

    pub fn out_of_sync(&self) -> bool {
        self.sync_status() != SyncStatus::InSync
    }

    /// Record a realtime demand and flip to `OutOfSync` in one protocol
    /// step. Called by the realtime side only.
    pub fn demand_seek(&self, location: TimeRef) {
        self.demand.store(location.universal(), Ordering::Relaxed);
        self.sync.store(SyncStatus::OutOfSync as u8, Ordering::Release);
        self.sync_losses.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh the demanded location without flipping state or counting
    /// another sync loss. Used while already out of sync, where the
    /// demand advances with the rolling transport.
    pub fn set_demand(&self, location: TimeRef) {
        self.demand.store(location.universal(), Ordering::Relaxed);
    }

    /// The location the realtime side is waiting for.
    pub fn demand(&self) -> TimeRef {
        TimeRef::new(self.demand.load(Ordering::Relaxed))
    }

    pub fn set_fill_percent(&self, percent: u8) {
        self.fill_percent.store(percent, Ordering::Relaxed);
    }

    pub fn fill_percent(&self) -> u8 {
        self.fill_percent.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn sync_losses(&self) -> u64 {
        self.sync_losses.load(Ordering::Relaxed)
    }
}

impl Default for BufferStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of transfer between disk and realtime: a planar buffer of
/// `channel_count x capacity` frames plus the source-file location of its
/// first frame.
#[derive(Debug)]
pub struct QueueBufferSlot {
    slot_number: usize,
    file_location: TimeRef,
    used_frames: usize,
    channels: Vec<Vec<f32>>,
}

impl QueueBufferSlot {
    pub fn new(slot_number: usize, channel_count: usize, capacity: usize) -> Self {
        QueueBufferSlot {
            slot_number,
            file_location: TimeRef::INVALID,
            used_frames: 0,
            channels: vec![vec![0.0; capacity]; channel_count],
        }
    }

    pub fn slot_number(&self) -> usize {
        self.slot_number
    }

    pub fn file_location(&self) -> TimeRef {
        self.file_location
    }

    pub fn set_file_location(&mut self, location: TimeRef) {
        self.file_location = location;
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames each channel can hold.
    pub fn capacity(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Frames actually written into the slot; equals the capacity except
    /// for the final partial slot of a capture.
    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn set_used_frames(&mut self, frames: usize) {
        debug_assert!(frames <= self.capacity());
        self.used_frames = frames;
    }

    pub fn channel(&self, chan: usize) -> &[f32] {
        &self.channels[chan]
    }

    pub fn channel_mut(&mut self, chan: usize) -> &mut [f32] {
        &mut self.channels[chan]
    }

    /// Copy `frames` frames out of a channel starting at `offset`.
    pub fn read_channel(&self, chan: usize, offset: usize, dest: &mut [f32]) {
        let frames = dest.len();
        debug_assert!(offset + frames <= self.used_frames);
        dest.copy_from_slice(&self.channels[chan][offset..offset + frames]);
    }
}

type SlotQueueProd = HeapProd<Box<QueueBufferSlot>>;
type SlotQueueCons = HeapCons<Box<QueueBufferSlot>>;

/// The filling side of a ring: recycles empty slots from `free`, publishes
/// full slots to `rt`. Held by disk I/O for read sources and by the
/// realtime thread for write sources.
pub struct SlotProducerHalf {
    rt: SlotQueueProd,
    free: SlotQueueCons,
    slot_count: usize,
}

impl SlotProducerHalf {
    /// Pop an empty slot to fill. `None` when every slot is queued full.
    pub fn acquire_free(&mut self) -> Option<Box<QueueBufferSlot>> {
        self.free.try_pop()
    }

    /// Publish a filled slot. The push is the release point for the slot's
    /// content. Failure means the fixed slot population was violated.
    pub fn publish(&mut self, slot: Box<QueueBufferSlot>) -> Result<(), Box<QueueBufferSlot>> {
        self.rt.try_push(slot)
    }

    /// Number of full slots currently queued.
    pub fn rt_len(&self) -> usize {
        self.rt.occupied_len()
    }

    /// Number of empty slots waiting to be filled.
    pub fn free_len(&self) -> usize {
        self.free.occupied_len()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}

impl std::fmt::Debug for SlotProducerHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotProducerHalf")
            .field("rt_len", &self.rt_len())
            .field("free_len", &self.free_len())
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

/// The consuming side of a ring: pops full slots from `rt`, returns spent
/// slots to `free`. Held by the realtime thread for read sources and by
/// disk I/O for write sources.
pub struct SlotConsumerHalf {
    rt: SlotQueueCons,
    free: SlotQueueProd,
    slot_count: usize,
}

impl SlotConsumerHalf {
    /// Pop the next full slot. `None` when the ring has run dry.
    pub fn take(&mut self) -> Option<Box<QueueBufferSlot>> {
        self.rt.try_pop()
    }

    /// Return a spent slot to the free queue.
    pub fn release(&mut self, slot: Box<QueueBufferSlot>) -> Result<(), Box<QueueBufferSlot>> {
        self.free.try_push(slot)
    }

    /// Number of full slots still queued.
    pub fn rt_len(&self) -> usize {
        self.rt.occupied_len()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}

impl std::fmt::Debug for SlotConsumerHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotConsumerHalf")
            .field("rt_len", &self.rt_len())
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

/// Allocate a ring of `slot_count` slots, all starting in the free queue.
///
/// Must only be called while the realtime thread is known not to touch the
/// source (before transport start or after device stop); disk I/O owns the
/// allocation points.
pub fn allocate_ring(
    slot_count: usize,
    channel_count: usize,
    slot_frames: usize,
) -> (SlotProducerHalf, SlotConsumerHalf) {
    let rt_queue = HeapRb::new(slot_count);
    let free_queue = HeapRb::new(slot_count);

    let (rt_prod, rt_cons) = rt_queue.split();
    let (mut free_prod, free_cons) = free_queue.split();

    for n in 0..slot_count {
        let slot = Box::new(QueueBufferSlot::new(n, channel_count, slot_frames));
        let pushed = free_prod.try_push(slot);
        debug_assert!(pushed.is_ok());
    }

    (
        SlotProducerHalf {
            rt: rt_prod,
            free: free_cons,
            slot_count,
        },
        SlotConsumerHalf {
            rt: rt_cons,
            free: free_prod,
            slot_count,
        },
    )
}
