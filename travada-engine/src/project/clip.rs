//! Audio clips: placed, edited views of a source region on the timeline
//!
//! A clip references its read source by id and owns the realtime handle
//! while placed on a track; it never owns the underlying decoder (disk
//! I/O does), and removing the clip hands the source back through the
//! disposal protocol.
//!
//! Time bookkeeping: `track_start` is timeline time, `source_start` is
//! where the clip window begins inside the file, and `length` is the
//! window size. `source_end = source_start + length` always; the source
//! file's own length comes from the reader and is stored nowhere else.

use crate::engine::bus::AudioBus;
use crate::engine::mixer;
use crate::engine::read_source::ReadSource;
use crate::engine::write_source::WriteSource;
use crate::error::Result;
use crate::peak::Peak;
use crate::project::fade::{FadeCurve, FadeType};
use crate::project::plugin::{PluginChain, ProcessContext};
use travada_common::gain::db_to_gain;
use travada_common::TimeRef;

/// Minimum clip length left over when trimming an edge (frames at the
/// clip's rate).
const MIN_CLIP_FRAMES: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    NotRecording,
    Recording,
    FinishingRecording,
}

/// One placed region of audio.
pub struct Clip {
    id: i64,
    name: String,
    sheet_id: i64,
    source_id: i64,
    read_source: Option<ReadSource>,
    write_source: Option<WriteSource>,
    recording: RecordingState,
    track_start: TimeRef,
    source_start: TimeRef,
    length: TimeRef,
    /// Reader-reported length of the whole source file.
    source_length: TimeRef,
    gain: f32,
    muted: bool,
    locked: bool,
    take: bool,
    selected: bool,
    fade_in: Option<FadeCurve>,
    fade_out: Option<FadeCurve>,
    chain: PluginChain,
}

impl Clip {
    pub fn new(id: i64, name: impl Into<String>, sheet_id: i64) -> Self {
        Clip {
            id,
            name: name.into(),
            sheet_id,
            source_id: 0,
            read_source: None,
            write_source: None,
            recording: RecordingState::NotRecording,
            track_start: TimeRef::ZERO,
            source_start: TimeRef::ZERO,
            length: TimeRef::ZERO,
            source_length: TimeRef::ZERO,
            gain: 1.0,
            muted: false,
            locked: false,
            take: false,
            selected: false,
            fade_in: None,
            fade_out: None,
            chain: PluginChain::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sheet_id(&self) -> i64 {
        self.sheet_id
    }

    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    pub fn track_start(&self) -> TimeRef {
        self.track_start
    }

    pub fn track_end(&self) -> TimeRef {
        self.track_start + self.length
    }

    pub fn source_start(&self) -> TimeRef {
        self.source_start
    }

    pub fn source_end(&self) -> TimeRef {
        self.source_start + self.length
    }

    pub fn length(&self) -> TimeRef {
        self.length
    }

    pub fn source_length(&self) -> TimeRef {
        self.source_length
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, db_to_gain(travada_common::gain::MAX_GAIN_DB));
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.update_source_active(true);
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_take(&self) -> bool {
        self.take
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recording
    }

    pub fn chain(&self) -> &PluginChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut PluginChain {
        &mut self.chain
    }

    pub fn fade_in(&self) -> Option<&FadeCurve> {
        self.fade_in.as_ref()
    }

    pub fn fade_out(&self) -> Option<&FadeCurve> {
        self.fade_out.as_ref()
    }

    /// Create (if needed) and resize the fade-in.
    pub fn set_fade_in_range(&mut self, range: TimeRef) {
        self.fade_in
            .get_or_insert_with(|| FadeCurve::new(FadeType::FadeIn))
            .set_range(range);
    }

    /// Create (if needed) and resize the fade-out.
    pub fn set_fade_out_range(&mut self, range: TimeRef) {
        self.fade_out
            .get_or_insert_with(|| FadeCurve::new(FadeType::FadeOut))
            .set_range(range);
    }

    pub fn fade_in_mut(&mut self) -> Option<&mut FadeCurve> {
        self.fade_in.as_mut()
    }

    pub fn fade_out_mut(&mut self) -> Option<&mut FadeCurve> {
        self.fade_out.as_mut()
    }

    pub fn remove_fade_in(&mut self) {
        self.fade_in = None;
    }

    pub fn remove_fade_out(&mut self) {
        self.fade_out = None;
    }

    pub fn read_source(&self) -> Option<&ReadSource> {
        self.read_source.as_ref()
    }

    pub fn read_source_mut(&mut self) -> Option<&mut ReadSource> {
        self.read_source.as_mut()
    }

    pub fn write_source(&self) -> Option<&WriteSource> {
        self.write_source.as_ref()
    }

    pub fn write_source_mut(&mut self) -> Option<&mut WriteSource> {
        self.write_source.as_mut()
    }

    pub fn channel_count(&self) -> usize {
        if let Some(source) = &self.read_source {
            return source.channel_count();
        }
        if let Some(writer) = &self.write_source {
            return writer.channel_count();
        }
        0
    }

    /// Attach the playback source. A fresh clip (zero length) takes the
    /// whole source as its window.
    pub fn set_read_source(&mut self, source: ReadSource) {
        self.source_id = source.id();
        self.source_length = source.length();
        if self.length == TimeRef::ZERO {
            self.source_start = TimeRef::ZERO;
            self.length = self.source_length;
        }
        self.read_source = Some(source);
        self.update_source_active(true);
    }

    /// Detach the playback source for removal/teardown.
    pub fn take_read_source(&mut self) -> Option<ReadSource> {
        if let Some(source) = &self.read_source {
            source.set_active(false);
        }
        self.read_source.take()
    }

    /// Switch into capture mode with a prepared write source.
    pub fn begin_recording(&mut self, writer: WriteSource) {
        self.source_start = TimeRef::ZERO;
        self.length = TimeRef::ZERO;
        self.take = true;
        self.recording = RecordingState::Recording;
        self.write_source = Some(writer);
    }

    /// Stop accepting capture input; the write source is handed back so
    /// its ring can be disposed once disk I/O finished the file.
    pub fn finish_recording(&mut self) -> Option<WriteSource> {
        if self.recording != RecordingState::Recording {
            return None;
        }
        self.recording = RecordingState::FinishingRecording;
        if let Some(writer) = &mut self.write_source {
            writer.finish();
        }
        self.write_source.take()
    }

    /// Recording is fully torn down once the finished file has been
    /// re-attached as a read source.
    pub fn recording_converted(&mut self) {
        self.recording = RecordingState::NotRecording;
    }

    /// Propagate audibility into the source's active flag so disk I/O
    /// stops filling rings nobody listens to. Audible sources also get
    /// a higher scheduling priority.
    pub fn update_source_active(&mut self, track_audible: bool) {
        if let Some(source) = &self.read_source {
            let active = track_audible && !self.muted;
            source.set_active(active);
            source
                .handles()
                .status
                .set_priority(if active { 2 } else { 1 });
        }
    }

    pub fn set_track_start(&mut self, location: TimeRef) {
        self.track_start = location.max_zero();
    }

    /// Trim the left edge: moves track position and source window
    /// together, clamped to the available source material.
    pub fn set_left_edge(&mut self, new_left: TimeRef, rate: u32) {
        let new_left = new_left.max_zero();
        let min_length = TimeRef::from_frames(MIN_CLIP_FRAMES, rate);

        if new_left < self.track_start {
            let available = self.source_start;
            let mut moving = self.track_start - new_left;
            if moving > available {
                moving = available;
            }
            self.source_start -= moving;
            self.track_start -= moving;
            self.length += moving;
        } else if new_left > self.track_start {
            let mut moving = new_left - self.track_start;
            if moving > self.length - min_length {
                moving = self.length - min_length;
            }
            self.source_start += moving;
            self.track_start += moving;
            self.length -= moving;
        }
    }

    /// Trim the right edge, clamped to the source length.
    pub fn set_right_edge(&mut self, new_right: TimeRef, rate: u32) {
        let new_right = new_right.max_zero();
        let min_length = TimeRef::from_frames(MIN_CLIP_FRAMES, rate);
        let track_end = self.track_end();

        if new_right > track_end {
            let available = self.source_length - self.source_end();
            let mut moving = new_right - track_end;
            if moving > available {
                moving = available;
            }
            self.length += moving;
        } else if new_right < track_end {
            let mut moving = track_end - new_right;
            if moving > self.length - min_length {
                moving = self.length - min_length;
            }
            self.length -= moving;
        }
    }

    /// Realtime process step: render this clip's contribution to the
    /// cycle `[t0, t1)` into `process_bus`.
    ///
    /// Returns 0 for "nothing audible" (silent, muted, out of range,
    /// sync loss), -1 for "source invalid: track renders silence", 1
    /// when samples were mixed.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        render_bus: &mut AudioBus,
        process_bus: &mut AudioBus,
        input_bus: Option<&AudioBus>,
        t0: TimeRef,
        t1: TimeRef,
        nframes: usize,
        rate: u32,
    ) -> i32 {
        // Silent clips contribute nothing.
        if self.channel_count() == 0 {
            return 0;
        }

        if self.recording == RecordingState::Recording {
            if let Some(bus) = input_bus {
                self.process_capture(bus, nframes);
            }
            return 0;
        }

        let valid = self
            .read_source
            .as_ref()
            .map(|s| s.is_valid())
            .unwrap_or(false);
        if !valid {
            return -1;
        }

        if self.muted || self.gain == 0.0 {
            return 0;
        }

        let track_end = self.track_end();
        if t0 >= track_end || t1 <= self.track_start {
            return 0;
        }

        // Head/tail bookkeeping when the clip edge falls inside the
        // cycle.
        let mut frames_to_process = nframes;
        let mut offset = 0usize;
        let file_location;
        if t0 < self.track_start {
            file_location = self.source_start;
            offset = (self.track_start - t0).to_frames(rate) as usize;
            debug_assert!(offset < nframes);
            frames_to_process -= offset;
        } else {
            file_location = t0 - self.track_start + self.source_start;
        }
        if track_end < t1 {
            let tail = (t1 - track_end).to_frames(rate) as usize;
            frames_to_process = frames_to_process.saturating_sub(tail);
        }
        if frames_to_process == 0 {
            return 0;
        }

        let source = self.read_source.as_mut().unwrap();
        let read = source.ringbuffer_read(render_bus, file_location, frames_to_process, true);
        if read == 0 {
            render_bus.silence(nframes);
            return 0;
        }

        // Fades are in clip-range time, measured from the clip's left
        // edge.
        let clip_offset = file_location - self.source_start;
        if let Some(fade) = &self.fade_in {
            fade.process(render_bus, clip_offset, self.length, read, rate);
        }
        if let Some(fade) = &self.fade_out {
            fade.process(render_bus, clip_offset, self.length, read, rate);
        }

        // The envelope runs in file-space time: trimming the clip leaves
        // automation glued to the source material.
        let ctx = ProcessContext {
            start: file_location,
            end: file_location + TimeRef::from_frames(read as i64, rate),
        };
        self.chain.process_pre_fader(render_bus, read, ctx);
        self.chain.process_fader(render_bus, read, ctx);
        self.chain.process_post_fader(render_bus, read, ctx);

        // Mix into the track bus: mono feeds both sides, stereo feeds
        // left/right.
        let channels = self.channel_count();
        let gain = self.gain;
        let end = offset + read;
        if channels == 1 {
            let src = render_bus.channel(0, read);
            let (left, right) = process_bus.two_channels_mut(0, 1, end);
            mixer::mix_buffers_with_gain(&mut left[offset..end], src, gain);
            mixer::mix_buffers_with_gain(&mut right[offset..end], src, gain);
        } else {
            for chan in 0..channels.min(process_bus.channel_count()) {
                let src = render_bus.channel(chan, read);
                let dest = &mut process_bus.channel_mut(chan, end)[offset..end];
                mixer::mix_buffers_with_gain(dest, src, gain);
            }
        }

        1
    }

    /// Capture path: push the track's input into the write source ring.
    fn process_capture(&mut self, input_bus: &AudioBus, nframes: usize) {
        let writer = match &mut self.write_source {
            Some(writer) => writer,
            None => return,
        };
        // A short write is a dropout; the disk side reports ring
        // pressure separately, so nothing to do here.
        let _ = writer.ringbuffer_write(input_bus, nframes, true);
        self.length = writer.captured_length();
    }

    /// Gain that brings the clip's loudest sample to `target_db` dBFS.
    ///
    /// Uses the peak store's cached norm values; a target of exactly
    /// 0 dBFS is nudged below full scale so the result never reads as
    /// clipped. When the factor cannot be computed (silent material) the
    /// current gain is returned, making repeated normalization a no-op.
    pub fn normalization_factor(&self, target_db: f32, peak: &mut Peak) -> Result<f32> {
        let mut target = db_to_gain(target_db);
        if (target - 1.0).abs() < f32::EPSILON * 2.0 {
            target -= f32::EPSILON;
        }

        let maxamp = peak.max_amplitude(self.source_start, self.source_end())?;
        if maxamp == 0.0 {
            return Ok(self.gain);
        }
        if (maxamp - target).abs() < f32::EPSILON * 2.0 {
            return Ok(self.gain);
        }
        Ok(target / maxamp)
    }
}
