//! Read sources: the realtime consumer side of a streamed audio file
//!
//! A [`ReadSource`] hands decoded frames to the clip that plays it, pulled
//! from the slot ring that disk I/O keeps filled. All file access happens
//! on the disk thread; this side only pops slots, copies samples and
//! updates atomic status.
//!
//! # Sync protocol (realtime side)
//!
//! - `InSync` / `QueueSeeked`: slots are consumed, possibly at an
//!   intra-slot offset. A head slot that does not cover the demanded
//!   location flips the state to `OutOfSync` with the demand recorded.
//! - `OutOfSync` / `QueueSeeking` / `FillDequeueFailure`: the call returns
//!   0 (the clip renders silence), refreshes the demand to the current
//!   cycle and drains stale slots back to the free queue so disk I/O has
//!   something to fill at the new location.
//!
//! Draining happens on this side because the realtime thread is the only
//! consumer of the `rt` queue; disk I/O never pops it.

use crate::engine::bus::AudioBus;
use crate::engine::slot::{BufferStatus, QueueBufferSlot, SlotConsumerHalf, SyncStatus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use travada_common::TimeRef;

/// Immutable facts about an audio source file, shared by every thread
/// that touches the source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
    pub channel_count: usize,
    pub file_rate: u32,
    /// Reader-reported length (the only place source length is stored).
    pub length: TimeRef,
}

/// Shared mutable state of one source: everything the realtime, disk and
/// control threads exchange about it. All fields are atomics or immutable.
#[derive(Debug, Clone)]
pub struct SourceHandles {
    pub info: Arc<SourceInfo>,
    pub status: Arc<BufferStatus>,
    /// Disk I/O keeps the ring filled only while set.
    pub active: Arc<AtomicBool>,
    /// Cleared when the file vanished or the decoder rejected it; clips
    /// referencing an invalid source render silence.
    pub valid: Arc<AtomicBool>,
}

impl SourceHandles {
    pub fn new(info: SourceInfo) -> Self {
        SourceHandles {
            info: Arc::new(info),
            status: Arc::new(BufferStatus::new()),
            active: Arc::new(AtomicBool::new(true)),
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> i64 {
        self.info.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

/// Ring state owned by the realtime side once disk I/O has allocated the
/// buffers.
pub struct RingAttachment {
    half: SlotConsumerHalf,
    /// Partially consumed head slot; the next demand's intra-slot offset
    /// is recomputed from its `file_location`.
    current: Option<Box<QueueBufferSlot>>,
    slot_frames: usize,
}

impl RingAttachment {
    pub fn new(half: SlotConsumerHalf, slot_frames: usize) -> Self {
        RingAttachment {
            half,
            current: None,
            slot_frames,
        }
    }

    /// Give the queue half up for disposal, returning any held slot to
    /// the free queue first.
    pub fn into_half(mut self) -> SlotConsumerHalf {
        if let Some(slot) = self.current.take() {
            let _ = self.half.release(slot);
        }
        self.half
    }
}

/// Realtime handle to a streamed source.
///
/// Owned by the clip that plays the source; the matching disk half lives
/// in the disk I/O registry. A `ReadSource` with zero channels is the
/// silent source and always produces nothing.
pub struct ReadSource {
    handles: SourceHandles,
    output_rate: u32,
    ring: Option<RingAttachment>,
}

impl ReadSource {
    pub fn new(handles: SourceHandles, output_rate: u32) -> Self {
        ReadSource {
            handles,
            output_rate,
            ring: None,
        }
    }

    /// A 0-channel source for clips without audio.
    pub fn silent(id: i64, output_rate: u32) -> Self {
        let handles = SourceHandles::new(SourceInfo {
            id,
            name: String::new(),
            path: PathBuf::new(),
            channel_count: 0,
            file_rate: output_rate,
            length: TimeRef::ZERO,
        });
        ReadSource::new(handles, output_rate)
    }

    pub fn handles(&self) -> &SourceHandles {
        &self.handles
    }

    pub fn id(&self) -> i64 {
        self.handles.info.id
    }

    pub fn channel_count(&self) -> usize {
        self.handles.info.channel_count
    }

    pub fn length(&self) -> TimeRef {
        self.handles.info.length
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn is_valid(&self) -> bool {
        self.handles.is_valid()
    }

    pub fn set_active(&self, active: bool) {
        self.handles.set_active(active);
    }

    /// Install the ring allocated by disk I/O. Called via the sheet
    /// command queue before the source is audible.
    pub fn attach_ring(&mut self, ring: RingAttachment) {
        self.ring = Some(ring);
    }

    /// Hand the ring back for disposal (device stop, source removal).
    /// Any partially consumed slot is returned to the free queue first.
    pub fn detach_ring(&mut self) -> Option<SlotConsumerHalf> {
        let mut ring = self.ring.take()?;
        if let Some(slot) = ring.current.take() {
            let _ = ring.half.release(slot);
        }
        Some(ring.half)
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }

    /// Pull `nframes` frames at `file_location` (source-file time) into
    /// the first frames of `bus`. Returns the frame count actually
    /// produced; 0 means "render silence this cycle".
    ///
    /// Realtime-safe: no locks, no allocation, no file access.
    pub fn ringbuffer_read(
        &mut self,
        bus: &mut AudioBus,
        file_location: TimeRef,
        nframes: usize,
        _realtime: bool,
    ) -> usize {
        if self.channel_count() == 0 || !self.handles.is_valid() {
            return 0;
        }
        let output_rate = self.output_rate;
        let ring = match &mut self.ring {
            Some(ring) => ring,
            None => return 0,
        };
        let status = &self.handles.status;

        match status.sync_status() {
            SyncStatus::InSync | SyncStatus::QueueSeeked => {}
            SyncStatus::OutOfSync
            | SyncStatus::QueueSeeking
            | SyncStatus::Unknown
            | SyncStatus::FillDequeueFailure => {
                status.set_demand(file_location);
                Self::drain_stale(ring);
                return 0;
            }
            SyncStatus::FillEnqueueFailure => return 0,
        }

        let channels = self.handles.info.channel_count.min(bus.channel_count());
        let mut produced = 0usize;

        while produced < nframes {
            let want = file_location + TimeRef::from_frames(produced as i64, output_rate);

            let slot = match ring.current.take() {
                Some(current) => current,
                None => match ring.half.take() {
                    Some(slot) => slot,
                    None => {
                        // Ring ran dry. During the seek handshake that just
                        // means the first slot has not arrived yet; while
                        // in sync it is a sync loss.
                        if status.sync_status() == SyncStatus::InSync {
                            status.demand_seek(want);
                        } else {
                            status.set_demand(file_location);
                        }
                        return produced;
                    }
                },
            };

            // Where does the demand sit inside this slot?
            let slot_offset = (want - slot.file_location()).to_frames(output_rate);
            if slot_offset < 0 || slot_offset as usize >= slot.used_frames() {
                // Non-contiguous slot: stale leftover or a missed seek.
                let stale = slot_offset >= 0;
                let seek_pending = status.sync_status() == SyncStatus::QueueSeeked;
                if ring.half.release(slot).is_err() {
                    status.set_sync_status(SyncStatus::FillEnqueueFailure);
                    return produced;
                }
                if seek_pending && stale {
                    // Pre-seek slot still queued; try the next one this
                    // cycle. A slot AHEAD of the demand can never resolve
                    // by skipping (disk only fills forward), so that case
                    // falls through to a fresh seek.
                    continue;
                }
                status.demand_seek(want);
                return produced;
            }
            let slot_offset = slot_offset as usize;
            if status.sync_status() == SyncStatus::QueueSeeked {
                status.set_sync_status(SyncStatus::InSync);
            }

            let take = (slot.used_frames() - slot_offset).min(nframes - produced);
            for chan in 0..channels {
                let dest = &mut bus.channel_mut(chan, produced + take)[produced..produced + take];
                slot.read_channel(chan, slot_offset, dest);
            }
            produced += take;

            if slot_offset + take >= slot.used_frames() {
                if ring.half.release(slot).is_err() {
                    status.set_sync_status(SyncStatus::FillEnqueueFailure);
                    return produced;
                }
            } else {
                ring.current = Some(slot);
            }
        }

        produced
    }

    /// Return every queued slot to the free side. Bounded by the slot
    /// population; pointer moves only.
    fn drain_stale(ring: &mut RingAttachment) {
        if let Some(slot) = ring.current.take() {
            let _ = ring.half.release(slot);
        }
        while let Some(slot) = ring.half.take() {
            if ring.half.release(slot).is_err() {
                break;
            }
        }
    }

    /// Frames one slot holds, once a ring is attached.
    pub fn slot_frames(&self) -> Option<usize> {
        self.ring.as_ref().map(|r| r.slot_frames)
    }
}
