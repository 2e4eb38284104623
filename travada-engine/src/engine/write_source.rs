//! Write sources: the realtime producer side of a captured or exported
//! stream
//!
//! A [`WriteSource`] accepts frames from a track's input bus (or the
//! master bus during export), packs them into ring slots and publishes
//! them for the disk side to encode. The encoder, dither and resampler
//! live with disk I/O; this side only copies samples and flips atomics.
//!
//! Lifecycle: created when a track is armed and transport starts, closed
//! when transport stops. On close the realtime side flushes its partial
//! slot and raises the finished flag; disk I/O drains whatever is queued,
//! flushes the resampler tail and finalizes the file.

use crate::engine::bus::AudioBus;
use crate::engine::slot::{BufferStatus, QueueBufferSlot, SlotProducerHalf, SyncStatus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use travada_common::TimeRef;

/// Shared state between the realtime half and the disk-side encoder.
#[derive(Debug, Clone)]
pub struct WriteHandles {
    pub id: i64,
    pub path: PathBuf,
    pub channel_count: usize,
    pub status: Arc<BufferStatus>,
    /// While set, the realtime side keeps accepting frames.
    pub recording: Arc<AtomicBool>,
    /// Raised by the realtime side after the final partial slot is
    /// published; disk I/O finalizes once it has drained the ring.
    pub finished: Arc<AtomicBool>,
    /// Frames accepted at the capture rate; polled for UI length display.
    pub frames_accepted: Arc<AtomicI64>,
}

impl WriteHandles {
    pub fn new(id: i64, path: PathBuf, channel_count: usize) -> Self {
        WriteHandles {
            id,
            path,
            channel_count,
            status: Arc::new(BufferStatus::new()),
            recording: Arc::new(AtomicBool::new(true)),
            finished: Arc::new(AtomicBool::new(false)),
            frames_accepted: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Realtime half of a capture/export stream.
pub struct WriteSource {
    handles: WriteHandles,
    capture_rate: u32,
    ring: Option<WriteRingAttachment>,
    /// Capture-rate frame index of the first frame of `current`.
    slot_start_frame: i64,
    frames_accepted: i64,
}

/// Ring state owned by the realtime side.
pub struct WriteRingAttachment {
    half: SlotProducerHalf,
    /// Slot being filled and the frames already in it.
    current: Option<(Box<QueueBufferSlot>, usize)>,
}

impl WriteRingAttachment {
    pub fn new(half: SlotProducerHalf) -> Self {
        WriteRingAttachment {
            half,
            current: None,
        }
    }

    /// Give the queue half up for disposal; a half-filled slot is pushed
    /// through the rt queue (marked with its real frame count) so the
    /// disk side can account for it.
    pub fn into_half(mut self) -> SlotProducerHalf {
        if let Some((mut slot, fill)) = self.current.take() {
            slot.set_used_frames(fill);
            let _ = self.half.publish(slot);
        }
        self.half
    }
}

impl WriteSource {
    pub fn new(handles: WriteHandles, capture_rate: u32) -> Self {
        WriteSource {
            handles,
            capture_rate,
            ring: None,
            slot_start_frame: 0,
            frames_accepted: 0,
        }
    }

    pub fn handles(&self) -> &WriteHandles {
        &self.handles
    }

    pub fn id(&self) -> i64 {
        self.handles.id
    }

    pub fn channel_count(&self) -> usize {
        self.handles.channel_count
    }

    pub fn is_recording(&self) -> bool {
        self.handles.is_recording()
    }

    pub fn attach_ring(&mut self, ring: WriteRingAttachment) {
        self.ring = Some(ring);
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }

    pub fn detach_ring(&mut self) -> Option<SlotProducerHalf> {
        let mut ring = self.ring.take()?;
        if let Some((mut slot, fill)) = ring.current.take() {
            // Hand the open slot back through the rt queue; the disk side
            // skips empty slots and recycles them.
            slot.set_used_frames(fill);
            let _ = ring.half.publish(slot);
        }
        Some(ring.half)
    }

    /// Captured length so far, as a universal time reference.
    pub fn captured_length(&self) -> TimeRef {
        TimeRef::from_frames(self.frames_accepted, self.capture_rate)
    }

    /// Accept `nframes` frames from the first channels of `bus`.
    ///
    /// Returns the frames actually accepted; a full ring drops the rest
    /// (the dropout is visible in the frames-accepted counter, and the
    /// disk side logs its fill level).
    ///
    /// Realtime-safe: no locks, no allocation, no file access.
    pub fn ringbuffer_write(&mut self, bus: &AudioBus, nframes: usize, _realtime: bool) -> usize {
        if !self.handles.is_recording() {
            return 0;
        }
        let channels = self.handles.channel_count.min(bus.channel_count());
        let capture_rate = self.capture_rate;
        let ring = match &mut self.ring {
            Some(ring) => ring,
            None => return 0,
        };

        let mut written = 0usize;
        while written < nframes {
            let (mut slot, fill) = match ring.current.take() {
                Some(current) => current,
                None => match ring.half.acquire_free() {
                    Some(mut slot) => {
                        slot.set_file_location(TimeRef::from_frames(
                            self.slot_start_frame,
                            capture_rate,
                        ));
                        (slot, 0)
                    }
                    None => {
                        self.handles
                            .status
                            .set_sync_status(SyncStatus::FillDequeueFailure);
                        break;
                    }
                },
            };

            let take = (slot.capacity() - fill).min(nframes - written);
            for chan in 0..channels {
                let src = &bus.channel(chan, written + take)[written..written + take];
                slot.channel_mut(chan)[fill..fill + take].copy_from_slice(src);
            }
            let fill = fill + take;
            written += take;

            if fill == slot.capacity() {
                slot.set_used_frames(fill);
                self.slot_start_frame += fill as i64;
                if ring.half.publish(slot).is_err() {
                    self.handles
                        .status
                        .set_sync_status(SyncStatus::FillEnqueueFailure);
                    break;
                }
            } else {
                ring.current = Some((slot, fill));
            }
        }

        self.frames_accepted += written as i64;
        self.handles
            .frames_accepted
            .store(self.frames_accepted, Ordering::Relaxed);
        written
    }

    /// Stop accepting frames, publish the final partial slot and raise
    /// the finished flag for the disk side. Called at a cycle boundary
    /// when transport stops.
    pub fn finish(&mut self) {
        self.handles.set_recording(false);
        if let Some(ring) = &mut self.ring {
            if let Some((mut slot, fill)) = ring.current.take() {
                slot.set_used_frames(fill);
                self.slot_start_frame += fill as i64;
                let _ = ring.half.publish(slot);
            }
        }
        self.handles.finished.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::slot::allocate_ring;

    fn input_bus(channels: usize, frames: usize, value: f32) -> AudioBus {
        let mut bus = AudioBus::new("input", channels, frames);
        for chan in 0..channels {
            bus.channel_mut(chan, frames).fill(value);
        }
        bus
    }

    #[test]
    fn frames_flow_into_published_slots() {
        let handles = WriteHandles::new(7, PathBuf::from("/tmp/take.wav"), 1);
        let (producer, mut consumer) = allocate_ring(4, 1, 64);
        let mut source = WriteSource::new(handles, 48_000);
        source.attach_ring(WriteRingAttachment::new(producer));

        let bus = input_bus(1, 128, 0.25);
        let written = source.ringbuffer_write(&bus, 128, true);
        assert_eq!(written, 128);

        // Two full slots must be queued for the disk side.
        let slot = consumer.take().unwrap();
        assert_eq!(slot.used_frames(), 64);
        assert_eq!(slot.file_location(), TimeRef::ZERO);
        assert_eq!(slot.channel(0)[0], 0.25);
        consumer.release(slot).unwrap();

        let slot = consumer.take().unwrap();
        assert_eq!(slot.file_location(), TimeRef::from_frames(64, 48_000));
        consumer.release(slot).unwrap();
        assert!(consumer.take().is_none());
    }

    #[test]
    fn partial_slot_held_until_finish() {
        let handles = WriteHandles::new(7, PathBuf::from("/tmp/take.wav"), 1);
        let (producer, mut consumer) = allocate_ring(4, 1, 64);
        let mut source = WriteSource::new(handles.clone(), 48_000);
        source.attach_ring(WriteRingAttachment::new(producer));

        let bus = input_bus(1, 100, 0.5);
        assert_eq!(source.ringbuffer_write(&bus, 100, true), 100);

        // One full slot published, 36 frames still in the open slot.
        let slot = consumer.take().unwrap();
        assert_eq!(slot.used_frames(), 64);
        consumer.release(slot).unwrap();
        assert!(consumer.take().is_none());

        source.finish();
        assert!(handles.is_finished());
        let slot = consumer.take().unwrap();
        assert_eq!(slot.used_frames(), 36);
        assert_eq!(source.captured_length(), TimeRef::from_frames(100, 48_000));
    }

    #[test]
    fn full_ring_drops_frames_but_keeps_count_consistent() {
        let handles = WriteHandles::new(7, PathBuf::from("/tmp/take.wav"), 1);
        let (producer, _consumer) = allocate_ring(2, 1, 32);
        let mut source = WriteSource::new(handles, 48_000);
        source.attach_ring(WriteRingAttachment::new(producer));

        let bus = input_bus(1, 128, 0.1);
        // Ring holds 2 slots of 32 frames plus one open slot; nothing
        // drains it, so at most 96 frames fit.
        let written = source.ringbuffer_write(&bus, 128, true);
        assert!(written <= 96);
        assert_eq!(source.captured_length(), TimeRef::from_frames(written as i64, 48_000));
    }

    #[test]
    fn stopped_source_accepts_nothing() {
        let handles = WriteHandles::new(7, PathBuf::from("/tmp/take.wav"), 1);
        let (producer, _consumer) = allocate_ring(2, 1, 32);
        let mut source = WriteSource::new(handles.clone(), 48_000);
        source.attach_ring(WriteRingAttachment::new(producer));

        handles.set_recording(false);
        let bus = input_bus(1, 32, 0.1);
        assert_eq!(source.ringbuffer_write(&bus, 32, true), 0);
    }
}
