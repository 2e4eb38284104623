//! Tracks and bus tracks
//!
//! An audio track renders its clips into a private process bus, runs its
//! plugin chain and is then routed by the sheet into its post-send
//! targets. A bus track has no clips; it sums whatever other tracks sent
//! into its input bus and runs its own chain. Routing is acyclic by
//! construction: a bus track may only send to the master or to a bus
//! track processed after it.

use crate::engine::bus::AudioBus;
use crate::engine::mixer;
use crate::project::clip::Clip;
use crate::project::plugin::{PluginChain, ProcessContext};
use travada_common::TimeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Bus,
}

/// Where a track's processed signal goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Master,
    /// Target bus track by id.
    Bus(i64),
}

pub struct Track {
    id: i64,
    name: String,
    kind: TrackKind,
    clips: Vec<Clip>,
    process_bus: AudioBus,
    /// Capture input (audio tracks) or submix accumulator (bus tracks).
    input_bus: AudioBus,
    chain: PluginChain,
    post_sends: Vec<SendTarget>,
    armed: bool,
    muted: bool,
    solo: bool,
    muted_by_solo: bool,
}

impl Track {
    pub fn new(id: i64, name: impl Into<String>, kind: TrackKind, block_size: usize) -> Self {
        Track {
            id,
            name: name.into(),
            kind,
            clips: Vec::new(),
            process_bus: AudioBus::new("process", 2, block_size),
            input_bus: AudioBus::new("input", 2, block_size),
            chain: PluginChain::new(),
            post_sends: vec![SendTarget::Master],
            armed: false,
            muted: false,
            solo: false,
            muted_by_solo: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn chain(&self) -> &PluginChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut PluginChain {
        &mut self.chain
    }

    pub fn post_sends(&self) -> &[SendTarget] {
        &self.post_sends
    }

    pub fn set_post_sends(&mut self, sends: Vec<SendTarget>) {
        self.post_sends = sends;
    }

    pub fn process_bus(&self) -> &AudioBus {
        &self.process_bus
    }

    pub fn input_bus(&self) -> &AudioBus {
        &self.input_bus
    }

    pub fn input_bus_mut(&mut self) -> &mut AudioBus {
        &mut self.input_bus
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.audible_state_changed();
    }

    pub fn is_solo(&self) -> bool {
        self.solo
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
        self.audible_state_changed();
    }

    pub fn is_muted_by_solo(&self) -> bool {
        self.muted_by_solo
    }

    /// Called by the sheet when another track's solo state changes.
    pub fn set_muted_by_solo(&mut self, muted: bool) {
        if self.muted_by_solo != muted {
            self.muted_by_solo = muted;
            self.audible_state_changed();
        }
    }

    pub fn is_audible(&self) -> bool {
        !self.muted && !self.muted_by_solo
    }

    fn audible_state_changed(&mut self) {
        let audible = self.is_audible();
        for clip in &mut self.clips {
            clip.update_source_active(audible);
        }
    }

    // ---- clips ----

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn clips_mut(&mut self) -> &mut [Clip] {
        &mut self.clips
    }

    pub fn add_clip(&mut self, mut clip: Clip) {
        debug_assert_eq!(self.kind, TrackKind::Audio, "bus tracks have no clips");
        clip.update_source_active(self.is_audible());
        self.clips.push(clip);
    }

    pub fn remove_clip(&mut self, clip_id: i64) -> Option<Clip> {
        let at = self.clips.iter().position(|c| c.id() == clip_id)?;
        let mut clip = self.clips.remove(at);
        clip.update_source_active(false);
        Some(clip)
    }

    pub fn clip_mut(&mut self, clip_id: i64) -> Option<&mut Clip> {
        self.clips.iter_mut().find(|c| c.id() == clip_id)
    }

    /// Timeline end of the last clip (transport auto-stop point).
    pub fn last_clip_end(&self) -> TimeRef {
        self.clips
            .iter()
            .map(|c| c.track_end())
            .max()
            .unwrap_or(TimeRef::ZERO)
    }

    /// Render one cycle into the process bus.
    ///
    /// `render_bus` is the sheet-wide clip scratch. Returns the number of
    /// clips that produced samples.
    pub fn process(
        &mut self,
        render_bus: &mut AudioBus,
        t0: TimeRef,
        t1: TimeRef,
        nframes: usize,
        rate: u32,
    ) -> usize {
        match self.kind {
            TrackKind::Audio => self.process_audio(render_bus, t0, t1, nframes, rate),
            TrackKind::Bus => {
                self.process_submix(t0, t1, nframes);
                0
            }
        }
    }

    fn process_audio(
        &mut self,
        render_bus: &mut AudioBus,
        t0: TimeRef,
        t1: TimeRef,
        nframes: usize,
        rate: u32,
    ) -> usize {
        self.process_bus.silence(nframes);

        let input = if self.armed {
            Some(&self.input_bus)
        } else {
            None
        };

        let mut produced = 0usize;
        for clip in &mut self.clips {
            let result = clip.process(
                render_bus,
                &mut self.process_bus,
                input,
                t0,
                t1,
                nframes,
                rate,
            );
            if result > 0 {
                produced += 1;
            }
            // result == -1: invalid source, the silence is already there.
        }

        if produced > 0 {
            let ctx = ProcessContext { start: t0, end: t1 };
            self.chain.process_pre_fader(&mut self.process_bus, nframes, ctx);
            self.chain.process_fader(&mut self.process_bus, nframes, ctx);
            self.chain.process_post_fader(&mut self.process_bus, nframes, ctx);
        }

        if !self.is_audible() && produced > 0 {
            self.process_bus.silence(nframes);
            produced = 0;
        }
        produced
    }

    /// Bus tracks: input accumulator -> chain -> process bus.
    fn process_submix(&mut self, t0: TimeRef, t1: TimeRef, nframes: usize) {
        self.process_bus.copy_from(&self.input_bus, nframes);
        self.input_bus.silence(nframes);

        let ctx = ProcessContext { start: t0, end: t1 };
        self.chain.process_pre_fader(&mut self.process_bus, nframes, ctx);
        self.chain.process_fader(&mut self.process_bus, nframes, ctx);
        self.chain.process_post_fader(&mut self.process_bus, nframes, ctx);

        if !self.is_audible() {
            self.process_bus.silence(nframes);
        }
    }

    /// Add this track's processed signal into a destination bus
    /// (post-send routing, done by the sheet).
    pub fn route_into(&self, dest: &mut AudioBus, nframes: usize) {
        for chan in 0..dest.channel_count().min(self.process_bus.channel_count()) {
            let src = self.process_bus.channel(chan, nframes);
            mixer::mix_buffers_no_gain(dest.channel_mut(chan, nframes), src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::plugin::{GainPlugin, Plugin};

    #[test]
    fn solo_mute_audibility() {
        let mut track = Track::new(1, "one", TrackKind::Audio, 64);
        assert!(track.is_audible());
        track.set_muted(true);
        assert!(!track.is_audible());
        track.set_muted(false);
        track.set_muted_by_solo(true);
        assert!(!track.is_audible());
    }

    #[test]
    fn bus_track_sums_its_input_through_the_chain() {
        let mut bus_track = Track::new(2, "verb", TrackKind::Bus, 64);
        bus_track
            .chain_mut()
            .add_plugin(Plugin::Gain(GainPlugin::new(0.5)), true);

        bus_track.input_bus_mut().channel_mut(0, 64).fill(0.8);
        bus_track.input_bus_mut().channel_mut(1, 64).fill(0.4);

        let mut render = AudioBus::new("render", 2, 64);
        bus_track.process(&mut render, TimeRef::ZERO, TimeRef::from_ms(1), 64, 48_000);

        assert!((bus_track.process_bus().channel(0, 64)[0] - 0.4).abs() < 1e-6);
        assert!((bus_track.process_bus().channel(1, 64)[0] - 0.2).abs() < 1e-6);
        // Accumulator cleared for the next cycle.
        assert!(bus_track.input_bus().channel(0, 64).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn route_into_accumulates() {
        let mut track = Track::new(3, "t", TrackKind::Bus, 32);
        track.input_bus_mut().channel_mut(0, 32).fill(0.25);
        let mut render = AudioBus::new("render", 2, 32);
        track.process(&mut render, TimeRef::ZERO, TimeRef::from_ms(1), 32, 48_000);

        let mut master = AudioBus::new("master", 2, 32);
        master.channel_mut(0, 32).fill(0.5);
        track.route_into(&mut master, 32);
        assert!((master.channel(0, 32)[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn default_send_is_master() {
        let track = Track::new(4, "t", TrackKind::Audio, 32);
        assert_eq!(track.post_sends(), &[SendTarget::Master]);
    }
}
