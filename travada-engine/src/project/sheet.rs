//! Sheets: one timeline, its tracks, transport and the realtime command
//! plumbing
//!
//! The [`Sheet`] itself is owned by the realtime thread (it moves into
//! the audio callback). Control threads never touch it directly: every
//! model mutation travels through a wait-free SPSC command queue drained
//! at the top of each cycle, and everything the realtime thread must not
//! deallocate travels back through the disposal queue. Either a command's
//! whole effect is visible to a cycle or none of it is.
//!
//! The transport clock lives here too: `location` advances by exactly
//! the cycle length while rolling, and is published atomically for
//! control-side display.

use crate::engine::bus::AudioBus;
use crate::engine::read_source::RingAttachment;
use crate::engine::slot::{SlotConsumerHalf, SlotProducerHalf};
use crate::engine::write_source::WriteRingAttachment;
use crate::project::clip::Clip;
use crate::project::track::{SendTarget, Track, TrackKind};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use travada_common::TimeRef;

/// Commands the control thread may apply to a running sheet.
pub enum SheetCommand {
    AddTrack(Box<Track>),
    RemoveTrack(i64),
    AddClip { track_id: i64, clip: Box<Clip> },
    RemoveClip { track_id: i64, clip_id: i64 },
    /// Ring allocated by disk I/O for a read source some clip references.
    AttachReadRing { source_id: i64, ring: RingAttachment },
    /// Ring allocated by disk I/O for a recording clip's write source.
    AttachWriteRing { source_id: i64, ring: WriteRingAttachment },
    /// First step of the lockless remove: the realtime thread gives the
    /// ring up at a cycle boundary and pushes it into the disposal queue.
    DetachSource { source_id: i64 },
    /// A finished capture's file, re-opened as a playback source for the
    /// clip that recorded it.
    ConvertRecordedClip {
        track_id: i64,
        clip_id: i64,
        source: Box<crate::engine::read_source::ReadSource>,
    },
    Start,
    Stop,
    Seek(TimeRef),
    SetTrackMute { track_id: i64, muted: bool },
    SetTrackSolo { track_id: i64, solo: bool },
    SetTrackArm { track_id: i64, armed: bool },
    SetClipMute { track_id: i64, clip_id: i64, muted: bool },
}

/// Objects the realtime thread must not free itself.
pub enum Disposal {
    ReadRing {
        source_id: i64,
        half: SlotConsumerHalf,
    },
    WriteRing {
        source_id: i64,
        half: SlotProducerHalf,
    },
    Clip(Box<Clip>),
    Track(Box<Track>),
}

/// Transport state shared with the control side.
#[derive(Debug, Default)]
pub struct TransportCtl {
    rolling: AtomicBool,
    recording: AtomicBool,
    location: AtomicI64,
}

impl TransportCtl {
    pub fn is_rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    /// Transport location as of the last completed cycle.
    pub fn location(&self) -> TimeRef {
        TimeRef::new(self.location.load(Ordering::Relaxed))
    }
}

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Control-side handle to a sheet that lives on the realtime thread.
pub struct SheetController {
    commands: HeapProd<SheetCommand>,
    disposals: HeapCons<Disposal>,
    transport: Arc<TransportCtl>,
}

impl SheetController {
    /// Queue a command for the next cycle boundary. Fails (returning the
    /// command) only if the queue is full, which means the realtime
    /// thread is not draining - back off and retry.
    pub fn send(&mut self, command: SheetCommand) -> Result<(), SheetCommand> {
        self.commands.try_push(command)
    }

    /// Collect everything the realtime thread has handed back.
    pub fn poll_disposals(&mut self) -> Vec<Disposal> {
        let mut out = Vec::new();
        while let Some(disposal) = self.disposals.try_pop() {
            out.push(disposal);
        }
        out
    }

    pub fn transport(&self) -> &Arc<TransportCtl> {
        &self.transport
    }
}

/// One mixable arrangement.
pub struct Sheet {
    id: i64,
    rate: u32,
    block_size: usize,
    tracks: Vec<Track>,
    master: AudioBus,
    /// Shared scratch every clip renders into before mixing.
    render_bus: AudioBus,
    location: TimeRef,
    rolling: bool,
    transport: Arc<TransportCtl>,
    commands: HeapCons<SheetCommand>,
    disposals: HeapProd<Disposal>,
}

impl Sheet {
    pub fn new(id: i64, rate: u32, block_size: usize) -> (Sheet, SheetController) {
        let (cmd_prod, cmd_cons) = HeapRb::<SheetCommand>::new(COMMAND_QUEUE_CAPACITY).split();
        let (disp_prod, disp_cons) = HeapRb::<Disposal>::new(COMMAND_QUEUE_CAPACITY).split();
        let transport = Arc::new(TransportCtl::default());

        let sheet = Sheet {
            id,
            rate,
            block_size,
            tracks: Vec::new(),
            master: AudioBus::new("master", 2, block_size),
            render_bus: AudioBus::new("render", 2, block_size),
            location: TimeRef::ZERO,
            rolling: false,
            transport: Arc::clone(&transport),
            commands: cmd_cons,
            disposals: disp_prod,
        };
        let controller = SheetController {
            commands: cmd_prod,
            disposals: disp_cons,
            transport,
        };
        (sheet, controller)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn master(&self) -> &AudioBus {
        &self.master
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    pub fn track_mut(&mut self, track_id: i64) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == track_id)
    }

    pub fn location(&self) -> TimeRef {
        self.location
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling
    }

    /// Timeline position where the material ends.
    pub fn end_location(&self) -> TimeRef {
        self.tracks
            .iter()
            .map(|t| t.last_clip_end())
            .max()
            .unwrap_or(TimeRef::ZERO)
    }

    /// Add a track directly (only valid before the sheet moves to the
    /// realtime thread; afterwards use [`SheetCommand::AddTrack`]).
    pub fn add_track(&mut self, track: Track) {
        self.tracks.push(track);
        self.solo_changed();
    }

    /// Render one cycle of `nframes <= block_size` frames into the
    /// master bus. Called from the audio callback; never blocks.
    pub fn process_cycle(&mut self, nframes: usize) {
        debug_assert!(nframes <= self.block_size);
        self.drain_commands();

        self.transport
            .location
            .store(self.location.universal(), Ordering::Relaxed);
        self.master.silence(nframes);

        if !self.rolling || nframes == 0 {
            return;
        }

        let t0 = self.location;
        let t1 = t0 + TimeRef::from_frames(nframes as i64, self.rate);

        // Audio tracks first: clips -> per-track chain.
        for track in &mut self.tracks {
            if track.kind() == TrackKind::Audio {
                track.process(&mut self.render_bus, t0, t1, nframes, self.rate);
            }
        }
        // Route their sends into the master and bus inputs.
        for i in 0..self.tracks.len() {
            if self.tracks[i].kind() == TrackKind::Audio {
                self.route_sends(i, nframes);
            }
        }
        // Bus tracks in order; a bus may feed only the master or a
        // later bus, so one forward pass suffices.
        for i in 0..self.tracks.len() {
            if self.tracks[i].kind() == TrackKind::Bus {
                self.tracks[i].process(&mut self.render_bus, t0, t1, nframes, self.rate);
                self.route_sends(i, nframes);
            }
        }

        self.location = t1;
        self.transport
            .location
            .store(self.location.universal(), Ordering::Relaxed);
    }

    fn route_sends(&mut self, from: usize, nframes: usize) {
        for send_index in 0..self.tracks[from].post_sends().len() {
            let target = self.tracks[from].post_sends()[send_index];
            match target {
                SendTarget::Master => {
                    let track = &self.tracks[from];
                    for chan in 0..self.master.channel_count() {
                        let src = track.process_bus().channel(chan, nframes);
                        crate::engine::mixer::mix_buffers_no_gain(
                            self.master.channel_mut(chan, nframes),
                            src,
                        );
                    }
                }
                SendTarget::Bus(bus_id) => {
                    let Some(to) = self.tracks.iter().position(|t| t.id() == bus_id) else {
                        continue;
                    };
                    if to == from {
                        continue;
                    }
                    let (a, b) = if from < to {
                        let (left, right) = self.tracks.split_at_mut(to);
                        (&left[from], &mut right[0])
                    } else {
                        let (left, right) = self.tracks.split_at_mut(from);
                        (&right[0], &mut left[to])
                    };
                    a.route_into(b.input_bus_mut(), nframes);
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: SheetCommand) {
        match command {
            SheetCommand::AddTrack(track) => {
                self.tracks.push(*track);
                self.solo_changed();
            }
            SheetCommand::RemoveTrack(track_id) => {
                if let Some(at) = self.tracks.iter().position(|t| t.id() == track_id) {
                    let track = self.tracks.remove(at);
                    let _ = self.disposals.try_push(Disposal::Track(Box::new(track)));
                    self.solo_changed();
                }
            }
            SheetCommand::AddClip { track_id, clip } => {
                match self.track_mut(track_id) {
                    Some(track) => track.add_clip(*clip),
                    // Unknown track: hand the clip back rather than
                    // dropping it on the audio thread.
                    None => {
                        let _ = self.disposals.try_push(Disposal::Clip(clip));
                    }
                }
            }
            SheetCommand::RemoveClip { track_id, clip_id } => {
                if let Some(track) = self.track_mut(track_id) {
                    if let Some(clip) = track.remove_clip(clip_id) {
                        let _ = self.disposals.try_push(Disposal::Clip(Box::new(clip)));
                    }
                }
            }
            SheetCommand::AttachReadRing { source_id, ring } => {
                let mut ring = Some(ring);
                'outer: for track in &mut self.tracks {
                    for clip in track.clips_mut() {
                        if clip.source_id() == source_id {
                            if let Some(source) = clip.read_source_mut() {
                                if !source.has_ring() {
                                    source.attach_ring(ring.take().unwrap());
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
                // An unmatched ring (clip vanished meanwhile) goes
                // straight back for disposal.
                if let Some(unused) = ring {
                    let _ = self.disposals.try_push(Disposal::ReadRing {
                        source_id,
                        half: unused.into_half(),
                    });
                }
            }
            SheetCommand::AttachWriteRing { source_id, ring } => {
                let mut ring = Some(ring);
                'outer: for track in &mut self.tracks {
                    for clip in track.clips_mut() {
                        if let Some(writer) = clip.write_source_mut() {
                            if writer.id() == source_id {
                                writer.attach_ring(ring.take().unwrap());
                                break 'outer;
                            }
                        }
                    }
                }
                if let Some(unused) = ring {
                    let _ = self.disposals.try_push(Disposal::WriteRing {
                        source_id,
                        half: unused.into_half(),
                    });
                }
            }
            SheetCommand::DetachSource { source_id } => {
                for track in &mut self.tracks {
                    for clip in track.clips_mut() {
                        if clip.source_id() == source_id {
                            if let Some(source) = clip.read_source_mut() {
                                if let Some(half) = source.detach_ring() {
                                    let _ = self
                                        .disposals
                                        .try_push(Disposal::ReadRing { source_id, half });
                                }
                            }
                        }
                    }
                }
            }
            SheetCommand::ConvertRecordedClip {
                track_id,
                clip_id,
                source,
            } => {
                if let Some(track) = self.track_mut(track_id) {
                    if let Some(clip) = track.clip_mut(clip_id) {
                        clip.set_read_source(*source);
                        clip.recording_converted();
                    }
                }
            }
            SheetCommand::Start => {
                self.rolling = true;
                self.transport.rolling.store(true, Ordering::Release);
            }
            SheetCommand::Stop => {
                self.rolling = false;
                self.transport.rolling.store(false, Ordering::Release);
                self.finish_recordings();
            }
            SheetCommand::Seek(location) => {
                self.location = location.max_zero();
                self.transport
                    .location
                    .store(self.location.universal(), Ordering::Relaxed);
            }
            SheetCommand::SetTrackMute { track_id, muted } => {
                if let Some(track) = self.track_mut(track_id) {
                    track.set_muted(muted);
                }
            }
            SheetCommand::SetTrackSolo { track_id, solo } => {
                if let Some(track) = self.track_mut(track_id) {
                    track.set_solo(solo);
                }
                self.solo_changed();
            }
            SheetCommand::SetTrackArm { track_id, armed } => {
                if let Some(track) = self.track_mut(track_id) {
                    track.set_armed(armed);
                }
            }
            SheetCommand::SetClipMute {
                track_id,
                clip_id,
                muted,
            } => {
                if let Some(track) = self.track_mut(track_id) {
                    if let Some(clip) = track.clip_mut(clip_id) {
                        clip.set_muted(muted);
                    }
                }
            }
        }
    }

    /// Solo on any audio track mutes every non-solo audio track.
    fn solo_changed(&mut self) {
        let any_solo = self
            .tracks
            .iter()
            .any(|t| t.kind() == TrackKind::Audio && t.is_solo());
        for track in &mut self.tracks {
            if track.kind() == TrackKind::Audio {
                track.set_muted_by_solo(any_solo && !track.is_solo());
            }
        }
    }

    /// Transport stop finishes every in-flight capture: the final
    /// partial slot is flushed and the ring handed back for disposal
    /// once disk I/O has finalized the file.
    fn finish_recordings(&mut self) {
        let mut finished = Vec::new();
        for track in &mut self.tracks {
            for clip in track.clips_mut() {
                if let Some(mut writer) = clip.finish_recording() {
                    let source_id = writer.id();
                    if let Some(half) = writer.detach_ring() {
                        finished.push(Disposal::WriteRing { source_id, half });
                    }
                }
            }
        }
        for disposal in finished {
            let _ = self.disposals.try_push(disposal);
        }
        self.transport.set_recording(false);
    }
}

/// Timeline positions clip edits snap to, rebuilt from clip edges when
/// marked dirty. Owned by the control side.
#[derive(Debug, Default)]
pub struct SnapList {
    positions: Vec<TimeRef>,
    dirty: bool,
}

impl SnapList {
    pub fn new() -> Self {
        SnapList {
            positions: Vec::new(),
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuild from clip `(start, end)` edges.
    pub fn update<I: IntoIterator<Item = (TimeRef, TimeRef)>>(&mut self, edges: I) {
        self.positions.clear();
        self.positions.push(TimeRef::ZERO);
        for (start, end) in edges {
            self.positions.push(start);
            self.positions.push(end);
        }
        self.positions.sort();
        self.positions.dedup();
        self.dirty = false;
    }

    /// Snap `location` to the nearest position within `threshold`.
    pub fn snap(&self, location: TimeRef, threshold: TimeRef) -> TimeRef {
        let mut best = location;
        let mut best_distance = threshold.universal() + 1;
        for &position in &self.positions {
            let distance = (position - location).universal().abs();
            if distance < best_distance {
                best = position;
                best_distance = distance;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet_with_tracks() -> (Sheet, SheetController) {
        let (mut sheet, controller) = Sheet::new(1, 48_000, 64);
        sheet.add_track(Track::new(10, "one", TrackKind::Audio, 64));
        sheet.add_track(Track::new(11, "two", TrackKind::Audio, 64));
        sheet.add_track(Track::new(20, "bus", TrackKind::Bus, 64));
        (sheet, controller)
    }

    #[test]
    fn transport_starts_and_advances_on_cycle_boundaries() {
        let (mut sheet, mut controller) = sheet_with_tracks();
        controller.send(SheetCommand::Start).ok().unwrap();

        sheet.process_cycle(64);
        assert!(sheet.is_rolling());
        assert_eq!(sheet.location(), TimeRef::from_frames(64, 48_000));
        assert_eq!(
            controller.transport().location(),
            TimeRef::from_frames(64, 48_000)
        );

        sheet.process_cycle(64);
        assert_eq!(sheet.location(), TimeRef::from_frames(128, 48_000));
    }

    #[test]
    fn stopped_transport_holds_position() {
        let (mut sheet, mut controller) = sheet_with_tracks();
        controller.send(SheetCommand::Start).ok().unwrap();
        sheet.process_cycle(64);
        controller.send(SheetCommand::Stop).ok().unwrap();
        sheet.process_cycle(64);
        sheet.process_cycle(64);
        assert_eq!(sheet.location(), TimeRef::from_frames(64, 48_000));
    }

    #[test]
    fn seek_applies_at_cycle_boundary() {
        let (mut sheet, mut controller) = sheet_with_tracks();
        controller.send(SheetCommand::Start).ok().unwrap();
        controller
            .send(SheetCommand::Seek(TimeRef::from_ms(5000)))
            .ok()
            .unwrap();
        sheet.process_cycle(64);
        assert_eq!(
            sheet.location(),
            TimeRef::from_ms(5000) + TimeRef::from_frames(64, 48_000)
        );
    }

    #[test]
    fn solo_mutes_other_audio_tracks_only() {
        let (mut sheet, mut controller) = sheet_with_tracks();
        controller
            .send(SheetCommand::SetTrackSolo {
                track_id: 10,
                solo: true,
            })
            .ok()
            .unwrap();
        sheet.process_cycle(64);

        assert!(!sheet.tracks()[0].is_muted_by_solo());
        assert!(sheet.tracks()[1].is_muted_by_solo());
        assert!(!sheet.tracks()[2].is_muted_by_solo(), "bus tracks are exempt");

        controller
            .send(SheetCommand::SetTrackSolo {
                track_id: 10,
                solo: false,
            })
            .ok()
            .unwrap();
        sheet.process_cycle(64);
        assert!(!sheet.tracks()[1].is_muted_by_solo());
    }

    #[test]
    fn removed_clip_returns_through_disposal_queue() {
        let (mut sheet, mut controller) = sheet_with_tracks();
        let clip = Clip::new(99, "take", 1);
        controller
            .send(SheetCommand::AddClip {
                track_id: 10,
                clip: Box::new(clip),
            })
            .ok()
            .unwrap();
        sheet.process_cycle(64);
        assert_eq!(sheet.tracks()[0].clips().len(), 1);

        controller
            .send(SheetCommand::RemoveClip {
                track_id: 10,
                clip_id: 99,
            })
            .ok()
            .unwrap();
        sheet.process_cycle(64);
        assert_eq!(sheet.tracks()[0].clips().len(), 0);

        let disposals = controller.poll_disposals();
        assert_eq!(disposals.len(), 1);
        assert!(matches!(&disposals[0], Disposal::Clip(clip) if clip.id() == 99));
    }

    #[test]
    fn snap_list_finds_nearest_edge() {
        let mut snap = SnapList::new();
        snap.update(vec![
            (TimeRef::from_ms(1000), TimeRef::from_ms(2500)),
            (TimeRef::from_ms(4000), TimeRef::from_ms(6000)),
        ]);

        let threshold = TimeRef::from_ms(200);
        assert_eq!(
            snap.snap(TimeRef::from_ms(1100), threshold),
            TimeRef::from_ms(1000)
        );
        assert_eq!(
            snap.snap(TimeRef::from_ms(3000), threshold),
            TimeRef::from_ms(3000),
            "too far from any edge"
        );
        assert_eq!(snap.snap(TimeRef::from_ms(90), threshold), TimeRef::ZERO);
    }
}
