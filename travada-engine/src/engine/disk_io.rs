//! Disk I/O scheduler
//!
//! One dedicated thread owns every decoder, encoder and file handle. It
//! keeps read rings filled and write rings drained, ranked by urgency:
//! read hunger is `free slots x priority`, write fullness is the queued
//! slot count. Each scheduling pass serves one slot per needy source in
//! urgency order, so a starving source cannot be shut out by a busy one.
//!
//! The thread wakes on a command or every half slot duration, whichever
//! comes first; the audio callback never signals it directly (nothing the
//! realtime thread may block on exists here).
//!
//! Ring buffers are allocated on this thread when a source is added and
//! freed when the control thread returns the realtime half for disposal
//! ("lockless remove"): the realtime thread detaches the ring at a cycle
//! boundary, the control thread forwards it here, and only then are the
//! slots dropped. No slot memory is ever freed while the realtime thread
//! can still touch it.

use crate::audiofile::dither::DitherMode;
use crate::audiofile::reader::{DecodeBuffer, ResampleReader};
use crate::audiofile::resampler::InputDrivenResampler;
use crate::audiofile::writer::FileWriter;
use crate::engine::read_source::{RingAttachment, SourceHandles};
use crate::engine::slot::{
    allocate_ring, SlotConsumerHalf, SlotProducerHalf, SyncStatus,
};
use crate::engine::write_source::{WriteHandles, WriteRingAttachment};
use crate::engine::mixer;
use crate::error::Result;
use crate::peak::builder::OnlinePeakBuilder;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use travada_common::config::{BitDepth, RecordFormat};
use travada_common::{EngineEvent, EventBus, TimeRef};

/// How a write stream reaches disk.
#[derive(Debug, Clone)]
pub struct WriteStreamSpec {
    pub format: RecordFormat,
    pub bit_depth: BitDepth,
    pub dither: DitherMode,
    /// Rate frames arrive at (device rate).
    pub capture_rate: u32,
    /// Rate written to the file.
    pub file_rate: u32,
    /// Build peak files alongside the capture.
    pub peakfiles_dir: Option<PathBuf>,
}

/// Commands accepted by the scheduler thread.
enum DiskIoCommand {
    AddReadSource(SourceHandles),
    RemoveReadSource(i64),
    AddWriteSource {
        handles: WriteHandles,
        spec: WriteStreamSpec,
    },
    /// Realtime half of a removed read source, routed back for disposal.
    DisposeReadRing {
        source_id: i64,
        half: SlotConsumerHalf,
    },
    /// Realtime half of a finished write source.
    DisposeWriteRing {
        source_id: i64,
        half: SlotProducerHalf,
    },
    Shutdown,
}

/// Ring halves handed back to the control thread for attachment to the
/// realtime side (via the sheet command queue).
pub enum RingDelivery {
    Read {
        source_id: i64,
        ring: RingAttachment,
    },
    Write {
        source_id: i64,
        ring: WriteRingAttachment,
    },
}

/// Handle owned by the control thread.
pub struct DiskIo {
    cmd_tx: Sender<DiskIoCommand>,
    delivery_rx: Receiver<RingDelivery>,
    worker: Option<JoinHandle<()>>,
}

impl DiskIo {
    /// Spawn the scheduler thread. `slot_frames` matches the device block
    /// size; `output_rate` is the device rate every read source converts
    /// to.
    pub fn spawn(output_rate: u32, slot_frames: usize, slot_count: usize, events: EventBus) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (delivery_tx, delivery_rx) = mpsc::channel();

        let worker = std::thread::Builder::new()
            .name("travada-diskio".to_string())
            .spawn(move || {
                let mut worker = Worker::new(
                    output_rate,
                    slot_frames,
                    slot_count,
                    events,
                    cmd_rx,
                    delivery_tx,
                );
                worker.run();
            })
            .expect("failed to spawn disk I/O thread");

        DiskIo {
            cmd_tx,
            delivery_rx,
            worker: Some(worker),
        }
    }

    pub fn add_read_source(&self, handles: SourceHandles) {
        let _ = self.cmd_tx.send(DiskIoCommand::AddReadSource(handles));
    }

    pub fn remove_read_source(&self, source_id: i64) {
        let _ = self.cmd_tx.send(DiskIoCommand::RemoveReadSource(source_id));
    }

    pub fn add_write_source(&self, handles: WriteHandles, spec: WriteStreamSpec) {
        let _ = self
            .cmd_tx
            .send(DiskIoCommand::AddWriteSource { handles, spec });
    }

    /// Final step of the lockless remove protocol.
    pub fn dispose_read_ring(&self, source_id: i64, half: SlotConsumerHalf) {
        let _ = self
            .cmd_tx
            .send(DiskIoCommand::DisposeReadRing { source_id, half });
    }

    pub fn dispose_write_ring(&self, source_id: i64, half: SlotProducerHalf) {
        let _ = self
            .cmd_tx
            .send(DiskIoCommand::DisposeWriteRing { source_id, half });
    }

    /// Rings allocated since the last poll, ready to attach realtime-side.
    pub fn poll_deliveries(&self) -> Vec<RingDelivery> {
        self.delivery_rx.try_iter().collect()
    }
}

impl Drop for DiskIo {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(DiskIoCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Disk-side state of one streamed read source.
struct DiskReadSource {
    handles: SourceHandles,
    reader: ResampleReader,
    ring: SlotProducerHalf,
    /// Output-rate location the next slot starts at.
    next_location: TimeRef,
    /// Set once the realtime half has been retired; only disposal remains.
    removed: bool,
}

/// Disk-side state of one write source.
struct DiskWriteSource {
    handles: WriteHandles,
    writer: FileWriter,
    resampler: InputDrivenResampler,
    peaks: Option<OnlinePeakBuilder>,
    ring: SlotConsumerHalf,
    planar_scratch: Vec<Vec<f32>>,
    interleave_scratch: Vec<f32>,
    finalized: bool,
    failed: bool,
    removed: bool,
}

struct Worker {
    output_rate: u32,
    slot_frames: usize,
    slot_count: usize,
    slot_duration: TimeRef,
    events: EventBus,
    cmd_rx: Receiver<DiskIoCommand>,
    delivery_tx: Sender<RingDelivery>,
    read_sources: Vec<DiskReadSource>,
    write_sources: Vec<DiskWriteSource>,
    /// Producer halves of removed read sources, waiting for the matching
    /// realtime half before the slots are dropped.
    retired_read: Vec<(i64, SlotProducerHalf)>,
    retired_write: Vec<(i64, SlotConsumerHalf)>,
    decode_scratch: DecodeBuffer,
    shutdown: bool,
}

impl Worker {
    fn new(
        output_rate: u32,
        slot_frames: usize,
        slot_count: usize,
        events: EventBus,
        cmd_rx: Receiver<DiskIoCommand>,
        delivery_tx: Sender<RingDelivery>,
    ) -> Self {
        Worker {
            output_rate,
            slot_frames,
            slot_count,
            slot_duration: TimeRef::from_frames(slot_frames as i64, output_rate),
            events,
            cmd_rx,
            delivery_tx,
            read_sources: Vec::new(),
            write_sources: Vec::new(),
            retired_read: Vec::new(),
            retired_write: Vec::new(),
            decode_scratch: DecodeBuffer::new(),
            shutdown: false,
        }
    }

    fn run(&mut self) {
        // Wake at least twice per slot duration even without commands.
        let wake = Duration::from_micros(
            (self.slot_frames as u64 * 1_000_000 / self.output_rate as u64 / 2).max(1_000),
        );
        debug!(
            "Disk I/O running: {} frames/slot at {} Hz, wake interval {:?}",
            self.slot_frames, self.output_rate, wake
        );

        while !self.shutdown {
            match self.cmd_rx.recv_timeout(wake) {
                Ok(cmd) => {
                    self.handle_command(cmd);
                    // Drain whatever else queued up before doing work.
                    while let Ok(cmd) = self.cmd_rx.try_recv() {
                        self.handle_command(cmd);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.do_work();
        }

        // Final drain so a capture stopped right before shutdown still
        // reaches the disk intact.
        self.do_work();
        info!("Disk I/O stopped");
    }

    fn handle_command(&mut self, cmd: DiskIoCommand) {
        match cmd {
            DiskIoCommand::AddReadSource(handles) => self.add_read_source(handles),
            DiskIoCommand::RemoveReadSource(id) => {
                if let Some(source) = self.read_sources.iter_mut().find(|s| s.handles.id() == id) {
                    source.removed = true;
                }
            }
            DiskIoCommand::AddWriteSource { handles, spec } => {
                self.add_write_source(handles, spec)
            }
            DiskIoCommand::DisposeReadRing { source_id, half } => {
                self.dispose_read(source_id, half)
            }
            DiskIoCommand::DisposeWriteRing { source_id, half } => {
                self.dispose_write(source_id, half)
            }
            DiskIoCommand::Shutdown => self.shutdown = true,
        }
    }

    fn add_read_source(&mut self, handles: SourceHandles) {
        let info = handles.info.clone();
        match ResampleReader::open(&info.path, self.output_rate, self.slot_frames) {
            Ok(reader) => {
                let (producer, consumer) = allocate_ring(
                    self.slot_count,
                    info.channel_count,
                    self.slot_frames,
                );
                handles.status.set_sync_status(SyncStatus::OutOfSync);
                handles.status.set_demand(TimeRef::INVALID);

                debug!(
                    "Read source {} added: {} ({} ch, {} Hz -> {} Hz)",
                    info.id,
                    info.path.display(),
                    info.channel_count,
                    reader.file_rate(),
                    self.output_rate
                );

                self.read_sources.push(DiskReadSource {
                    handles,
                    reader,
                    ring: producer,
                    next_location: TimeRef::INVALID,
                    removed: false,
                });
                let _ = self.delivery_tx.send(RingDelivery::Read {
                    source_id: info.id,
                    ring: RingAttachment::new(consumer, self.slot_frames),
                });
            }
            Err(e) => {
                handles.mark_invalid();
                warn!("Read source {} failed to open: {}", info.path.display(), e);
                self.events.emit(EngineEvent::SourceInvalid {
                    source_id: info.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn add_write_source(&mut self, handles: WriteHandles, spec: WriteStreamSpec) {
        let channels = handles.channel_count;
        let result: Result<DiskWriteSource> = (|| {
            let writer = FileWriter::create(
                &handles.path,
                spec.format,
                channels as u16,
                spec.file_rate,
                spec.bit_depth,
                spec.dither,
            )?;
            let resampler = InputDrivenResampler::new(
                spec.capture_rate,
                spec.file_rate,
                channels,
                self.slot_frames,
            )?;
            let peaks = match &spec.peakfiles_dir {
                Some(dir) => Some(OnlinePeakBuilder::create(
                    dir,
                    &handles.path,
                    channels,
                    spec.file_rate,
                )?),
                None => None,
            };
            let (producer, consumer) =
                allocate_ring(self.slot_count, channels, self.slot_frames);
            let source = DiskWriteSource {
                handles: handles.clone(),
                writer,
                resampler,
                peaks,
                ring: consumer,
                planar_scratch: vec![Vec::new(); channels],
                interleave_scratch: Vec::new(),
                finalized: false,
                failed: false,
                removed: false,
            };
            let _ = self.delivery_tx.send(RingDelivery::Write {
                source_id: handles.id,
                ring: WriteRingAttachment::new(producer),
            });
            Ok(source)
        })();

        match result {
            Ok(source) => {
                debug!(
                    "Write source {} added: {} ({} ch)",
                    handles.id,
                    handles.path.display(),
                    channels
                );
                self.write_sources.push(source);
            }
            Err(e) => {
                handles.set_recording(false);
                warn!("Write source {} failed: {}", handles.path.display(), e);
                self.events.emit(EngineEvent::critical(format!(
                    "Cannot record to {}: {}",
                    handles.path.display(),
                    e
                )));
            }
        }
    }

    fn dispose_read(&mut self, source_id: i64, half: SlotConsumerHalf) {
        self.read_sources
            .retain(|s| !(s.handles.id() == source_id && s.removed));
        self.retired_read.retain(|(id, _)| *id != source_id);
        drop(half);
        debug!("Read source {} ring disposed", source_id);
    }

    fn dispose_write(&mut self, source_id: i64, half: SlotProducerHalf) {
        // The writer may still be draining; mark it so the entry is
        // purged once finalization has run.
        for source in &mut self.write_sources {
            if source.handles.id == source_id {
                source.removed = true;
            }
        }
        self.write_sources
            .retain(|s| !(s.handles.id == source_id && s.finalized));
        self.retired_write.retain(|(id, _)| *id != source_id);
        drop(half);
        debug!("Write source {} ring disposed", source_id);
    }

    /// One scheduling round: rank all sources by urgency, then serve one
    /// slot per needy source per pass until nobody needs service.
    fn do_work(&mut self) {
        // Generous bound; normally fills settle long before this.
        let max_passes = self.slot_count * 2 + 4;

        for _ in 0..max_passes {
            let mut served_any = false;

            // (urgency, is_write, index)
            let mut ranking: Vec<(u64, bool, usize)> = Vec::new();
            for (idx, source) in self.read_sources.iter().enumerate() {
                if source.removed || !source.handles.is_valid() {
                    continue;
                }
                if !source.handles.is_active()
                    && source.handles.status.sync_status() == SyncStatus::InSync
                {
                    continue;
                }
                let hunger =
                    source.ring.free_len() as u64 * source.handles.status.priority() as u64;
                if hunger > 0 || source.handles.status.out_of_sync() {
                    ranking.push((hunger, false, idx));
                }
            }
            for (idx, source) in self.write_sources.iter().enumerate() {
                if source.finalized {
                    continue;
                }
                let fullness = source.ring.rt_len() as u64;
                if fullness > 0 || source.handles.is_finished() {
                    ranking.push((fullness, true, idx));
                }
            }
            ranking.sort_by(|a, b| b.0.cmp(&a.0));

            for (_, is_write, idx) in ranking {
                let did = if is_write {
                    self.serve_write(idx)
                } else {
                    self.serve_read(idx)
                };
                served_any |= did;
            }

            if !served_any {
                break;
            }
        }

        // Publish fill levels for the control plane.
        for source in &self.read_sources {
            let percent =
                (source.ring.rt_len() * 100 / source.ring.slot_count().max(1)) as u8;
            source.handles.status.set_fill_percent(percent);
        }

        // Finalized writers whose realtime half came back are done for
        // good.
        self.write_sources.retain(|s| !(s.finalized && s.removed));
    }

    /// Fill at most one slot for a read source. Returns true if work was
    /// done.
    fn serve_read(&mut self, idx: usize) -> bool {
        let slot_duration = self.slot_duration;
        let output_rate = self.output_rate;
        let source = &mut self.read_sources[idx];
        let status = source.handles.status.clone();

        match status.sync_status() {
            SyncStatus::OutOfSync | SyncStatus::Unknown | SyncStatus::FillDequeueFailure => {
                let demand = status.demand();
                if !demand.is_valid() {
                    return false;
                }
                // Reposition: align the demand to a whole output frame.
                let out_frame = demand.to_frames(output_rate);
                source.next_location = TimeRef::from_frames(out_frame, output_rate);
                match source.reader.seek_out_frame(out_frame) {
                    Ok(_) => {
                        status.set_sync_status(SyncStatus::QueueSeeking);
                    }
                    Err(e) => {
                        warn!(
                            "Source {}: seek failed, marking invalid: {}",
                            source.handles.id(),
                            e
                        );
                        source.handles.mark_invalid();
                        self.events.emit(EngineEvent::SourceInvalid {
                            source_id: source.handles.id(),
                            reason: e.to_string(),
                        });
                        return false;
                    }
                }
                true
            }
            SyncStatus::QueueSeeking => {
                // The demand may have moved on while we were seeking
                // (transport keeps rolling during the handshake).
                let demand = status.demand();
                let drift = (demand - source.next_location).universal().abs();
                if drift >= slot_duration.universal() {
                    status.set_sync_status(SyncStatus::OutOfSync);
                    return true;
                }
                match Self::fill_one_slot(source, self.slot_frames, &mut self.decode_scratch) {
                    FillOutcome::Filled => {
                        status.set_sync_status(SyncStatus::QueueSeeked);
                        true
                    }
                    FillOutcome::NoFreeSlot => false,
                    FillOutcome::Failed => false,
                }
            }
            SyncStatus::QueueSeeked | SyncStatus::InSync => {
                if !source.handles.is_active() {
                    return false;
                }
                matches!(
                    Self::fill_one_slot(source, self.slot_frames, &mut self.decode_scratch),
                    FillOutcome::Filled
                )
            }
            SyncStatus::FillEnqueueFailure => false,
        }
    }

    /// Read `slot_frames` frames at the source's next location into a
    /// free slot and publish it. Frames past EOF are silence.
    fn fill_one_slot(
        source: &mut DiskReadSource,
        slot_frames: usize,
        scratch: &mut DecodeBuffer,
    ) -> FillOutcome {
        let mut slot = match source.ring.acquire_free() {
            Some(slot) => slot,
            None => return FillOutcome::NoFreeSlot,
        };

        let out_frame = source.next_location.to_frames(source.reader.output_rate());
        let channels = source.reader.channel_count();

        let read = match source.reader.read_at(scratch, out_frame, slot_frames) {
            Ok(read) => read,
            Err(e) => {
                warn!("Source {}: read failed: {}", source.handles.id(), e);
                source.handles.mark_invalid();
                // The slot goes back out full of silence so the queue
                // population stays intact.
                0
            }
        };

        for chan in 0..channels.min(slot.channel_count()) {
            let dest = slot.channel_mut(chan);
            dest[..read].copy_from_slice(&scratch.channel(chan)[..read]);
            dest[read..slot_frames].fill(0.0);
        }
        slot.set_file_location(source.next_location);
        slot.set_used_frames(slot_frames);

        source.next_location += TimeRef::from_frames(slot_frames as i64, source.reader.output_rate());

        if source.ring.publish(slot).is_err() {
            source
                .handles
                .status
                .set_sync_status(SyncStatus::FillEnqueueFailure);
            return FillOutcome::Failed;
        }
        FillOutcome::Filled
    }

    /// Drain at most one slot of a write source; finalize when the
    /// realtime side finished and the ring is empty.
    fn serve_write(&mut self, idx: usize) -> bool {
        let source = &mut self.write_sources[idx];
        if source.finalized {
            return false;
        }

        let mut did_work = false;
        if let Some(slot) = source.ring.take() {
            if slot.used_frames() > 0 && !source.failed {
                if let Err(e) = Self::encode_slot(source, &slot) {
                    source.failed = true;
                    source.handles.set_recording(false);
                    warn!(
                        "Write source {}: encode failed: {}",
                        source.handles.path.display(),
                        e
                    );
                    self.events.emit(EngineEvent::critical(format!(
                        "Recording to {} stopped: {}",
                        source.handles.path.display(),
                        e
                    )));
                }
            }
            if source.ring.release(slot).is_err() {
                source
                    .handles
                    .status
                    .set_sync_status(SyncStatus::FillEnqueueFailure);
            }
            did_work = true;
        }

        let percent = (source.ring.rt_len() * 100 / source.ring.slot_count().max(1)) as u8;
        source.handles.status.set_fill_percent(percent);

        if source.handles.is_finished() && source.ring.rt_len() == 0 {
            self.finalize_write(idx);
            return true;
        }
        did_work
    }

    fn encode_slot(source: &mut DiskWriteSource, slot: &crate::engine::slot::QueueBufferSlot) -> Result<()> {
        let channels = source.handles.channel_count;
        let frames = slot.used_frames();

        for (chan, scratch) in source.planar_scratch.iter_mut().enumerate() {
            scratch.clear();
            scratch.extend_from_slice(&slot.channel(chan)[..frames]);
            debug_assert!(chan < channels);
        }

        let converted = source.resampler.process(&source.planar_scratch)?;
        let out_frames = converted.first().map(|c| c.len()).unwrap_or(0);
        if out_frames == 0 {
            return Ok(());
        }

        if let Some(peaks) = &mut source.peaks {
            for (chan, data) in converted.iter().enumerate() {
                peaks.process(chan, data)?;
            }
        }

        source
            .interleave_scratch
            .resize(out_frames * channels, 0.0);
        let refs: Vec<&[f32]> = converted.iter().map(|c| c.as_slice()).collect();
        mixer::interleave(&refs, &mut source.interleave_scratch);
        source.writer.write_frames(&source.interleave_scratch)?;
        Ok(())
    }

    fn finalize_write(&mut self, idx: usize) {
        let source = &mut self.write_sources[idx];

        let result: Result<()> = (|| {
            if !source.failed {
                // Flush resampler-held leftovers into the file.
                let tail = source.resampler.flush()?;
                let out_frames = tail.first().map(|c| c.len()).unwrap_or(0);
                if out_frames > 0 {
                    if let Some(peaks) = &mut source.peaks {
                        for (chan, data) in tail.iter().enumerate() {
                            peaks.process(chan, data)?;
                        }
                    }
                    let channels = source.handles.channel_count;
                    source.interleave_scratch.resize(out_frames * channels, 0.0);
                    let refs: Vec<&[f32]> = tail.iter().map(|c| c.as_slice()).collect();
                    mixer::interleave(&refs, &mut source.interleave_scratch);
                    source.writer.write_frames(&source.interleave_scratch)?;
                }
            }
            source.writer.finalize()?;
            if let Some(mut peaks) = source.peaks.take() {
                peaks.finish()?;
            }
            Ok(())
        })();

        source.finalized = true;
        let frames = source.writer.frames_written();
        match result {
            Ok(()) => {
                info!(
                    "Write source {} finished: {} frames in {}",
                    source.handles.id,
                    frames,
                    source.handles.path.display()
                );
                self.events.emit(EngineEvent::RecordingFinished {
                    source_id: source.handles.id,
                    frames,
                    file_name: source.handles.path.display().to_string(),
                });
            }
            Err(e) => {
                warn!(
                    "Write source {} failed to finalize: {}",
                    source.handles.path.display(),
                    e
                );
                self.events.emit(EngineEvent::critical(format!(
                    "Failed to finalize {}: {}",
                    source.handles.path.display(),
                    e
                )));
            }
        }
    }
}

enum FillOutcome {
    Filled,
    NoFreeSlot,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::AudioBus;
    use crate::engine::read_source::{ReadSource, SourceInfo};
    use crate::engine::write_source::WriteSource;
    use std::time::Instant;

    fn write_ramp_wav(path: &std::path::Path, frames: usize, rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for frame in 0..frames {
            writer.write_sample(frame as f32 / frames as f32).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn wait_for<F: FnMut() -> bool>(mut condition: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn streamed_source(
        disk: &DiskIo,
        path: std::path::PathBuf,
        rate: u32,
        frames: i64,
    ) -> ReadSource {
        let handles = SourceHandles::new(SourceInfo {
            id: 42,
            name: "ramp".into(),
            path,
            channel_count: 1,
            file_rate: rate,
            length: TimeRef::from_frames(frames, rate),
        });
        disk.add_read_source(handles.clone());

        let mut source = ReadSource::new(handles, rate);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !source.has_ring() {
            for delivery in disk.poll_deliveries() {
                if let RingDelivery::Read { ring, .. } = delivery {
                    source.attach_ring(ring);
                }
            }
            assert!(Instant::now() < deadline, "ring never delivered");
            std::thread::sleep(Duration::from_millis(5));
        }
        source
    }

    #[test]
    fn read_source_reaches_in_sync_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let rate = 44_100;
        write_ramp_wav(&path, 44_100, rate);

        let events = EventBus::new();
        let disk = DiskIo::spawn(rate, 256, 8, events);
        let mut source = streamed_source(&disk, path, rate, 44_100);

        let mut bus = AudioBus::new("render", 1, 256);
        // First demand: out of sync, returns 0 and records the demand.
        assert_eq!(source.ringbuffer_read(&mut bus, TimeRef::ZERO, 256, true), 0);

        // Disk seeks and primes the ring; within a few cycles the source
        // must deliver.
        let mut location = TimeRef::ZERO;
        let mut cycles_until_sound = 0;
        let got = loop {
            let got = source.ringbuffer_read(&mut bus, location, 256, true);
            if got > 0 {
                break got;
            }
            cycles_until_sound += 1;
            assert!(cycles_until_sound < 1000, "source never synced");
            std::thread::sleep(Duration::from_millis(2));
        };
        assert_eq!(got, 256);
        assert!((bus.channel(0, 1)[0] - 0.0).abs() < 1e-6);

        // Stream on; data must stay contiguous with the file ramp.
        location = TimeRef::from_frames(256, rate);
        let mut next_expected = 256f32;
        for _ in 0..20 {
            let mut got = 0;
            wait_for(
                || {
                    got = source.ringbuffer_read(&mut bus, location, 256, true);
                    got > 0
                },
                "continued streaming",
            );
            assert_eq!(got, 256);
            assert!(
                (bus.channel(0, 1)[0] - next_expected / 44_100.0).abs() < 1e-5,
                "expected frame {}",
                next_expected
            );
            location += TimeRef::from_frames(256, rate);
            next_expected += 256.0;
        }
    }

    #[test]
    fn seek_resyncs_within_half_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let rate = 48_000;
        write_ramp_wav(&path, 240_000, rate);

        let events = EventBus::new();
        let disk = DiskIo::spawn(rate, 256, 16, events);
        let mut source = streamed_source(&disk, path, rate, 240_000);

        let mut bus = AudioBus::new("render", 1, 256);
        let mut location = TimeRef::ZERO;
        wait_for(
            || source.ringbuffer_read(&mut bus, location, 256, true) > 0,
            "initial sync",
        );

        // Jump the transport to 2 seconds in.
        location = TimeRef::from_frames(96_000, rate);
        let mut silent_cycles = 0;
        loop {
            let got = source.ringbuffer_read(&mut bus, location, 256, true);
            if got > 0 {
                break;
            }
            silent_cycles += 1;
            assert!(silent_cycles < 500, "never re-synced after seek");
            // Cycle keeps rolling while out of sync.
            location += TimeRef::from_frames(256, rate);
            std::thread::sleep(Duration::from_millis(2));
        }
        // The first synced cycle delivers file data from the demanded
        // location (ramp value matches the location's frame index).
        let expected = location.to_frames(rate) as f32 / 240_000.0;
        assert!(
            (bus.channel(0, 1)[0] - expected).abs() < 1e-4,
            "got {}, expected {}",
            bus.channel(0, 1)[0],
            expected
        );
    }

    #[test]
    fn write_source_reaches_disk_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        let rate = 48_000;

        let events = EventBus::new();
        let mut event_rx = events.subscribe();
        let disk = DiskIo::spawn(rate, 256, 8, events.clone());

        let handles = WriteHandles::new(9, path.clone(), 1);
        disk.add_write_source(
            handles.clone(),
            WriteStreamSpec {
                format: RecordFormat::Wav,
                bit_depth: BitDepth::Float32,
                dither: DitherMode::None,
                capture_rate: rate,
                file_rate: rate,
                peakfiles_dir: None,
            },
        );

        let mut source = WriteSource::new(handles.clone(), rate);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut attached = false;
        while !attached {
            for delivery in disk.poll_deliveries() {
                if let RingDelivery::Write { ring, .. } = delivery {
                    source.attach_ring(ring);
                    attached = true;
                }
            }
            assert!(Instant::now() < deadline, "write ring never delivered");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Capture 1000 frames of DC then stop.
        let mut bus = AudioBus::new("input", 1, 256);
        bus.channel_mut(0, 256).fill(0.5);
        let mut pushed = 0;
        while pushed < 1000 {
            let n = (1000 - pushed).min(256);
            let written = source.ringbuffer_write(&bus, n, true);
            pushed += written;
            if written < n {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        source.finish();

        // Disk must drain, flush and announce the finished file.
        wait_for(
            || matches!(event_rx.try_recv(), Ok(EngineEvent::RecordingFinished { .. })),
            "recording finished event",
        );

        drop(disk);
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.duration(), 1000);
        let samples: Vec<f32> = reader
            .into_samples::<f32>()
            .map(|s| s.unwrap())
            .collect();
        assert!(samples.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn missing_file_marks_source_invalid() {
        let events = EventBus::new();
        let mut event_rx = events.subscribe();
        let disk = DiskIo::spawn(44_100, 256, 8, events.clone());

        let handles = SourceHandles::new(SourceInfo {
            id: 5,
            name: "gone".into(),
            path: PathBuf::from("/nonexistent/audio.wav"),
            channel_count: 2,
            file_rate: 44_100,
            length: TimeRef::ZERO,
        });
        disk.add_read_source(handles.clone());

        wait_for(|| !handles.is_valid(), "source marked invalid");
        wait_for(
            || matches!(event_rx.try_recv(), Ok(EngineEvent::SourceInvalid { .. })),
            "source invalid event",
        );
    }
}
