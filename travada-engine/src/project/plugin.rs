//! Plugin chains
//!
//! A chain is an ordered list of processing nodes with one distinguished
//! member: the gain envelope ("fader"). Nodes before it run pre-fader,
//! nodes after it post-fader, and the envelope itself is applied between
//! the two. The envelope cannot be removed.
//!
//! Structural changes go through the sheet command queue; the realtime
//! thread only ever sees a chain in a consistent state.

use crate::engine::bus::AudioBus;
use crate::engine::mixer;
use crate::project::curve::Curve;
use travada_common::TimeRef;

/// Time context a chain processes in. Envelope automation is looked up
/// against these bounds, once per cycle.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    /// Automation-time of the buffer's first frame. For clip chains this
    /// is clip-source time; for track chains, track time.
    pub start: TimeRef,
    /// Automation-time one past the buffer's last frame.
    pub end: TimeRef,
}

/// The distinguished fader node: a base gain plus an automation curve.
#[derive(Debug, Clone, PartialEq)]
pub struct GainEnvelope {
    gain: f32,
    curve: Curve,
}

impl GainEnvelope {
    pub fn new() -> Self {
        GainEnvelope {
            gain: 1.0,
            curve: Curve::new(1.0),
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.max(0.0);
    }

    pub fn curve(&self) -> &Curve {
        &self.curve
    }

    pub fn curve_mut(&mut self) -> &mut Curve {
        &mut self.curve
    }

    /// Apply the envelope across a buffer: one lookup at each cycle
    /// bound, linear ramp in between.
    pub fn process(&mut self, bus: &mut AudioBus, nframes: usize, ctx: ProcessContext) {
        let from = self.gain * self.curve.value_at(ctx.start) as f32;
        let to = self.gain * self.curve.value_at(ctx.end) as f32;
        if (from - 1.0).abs() < f32::EPSILON && (to - 1.0).abs() < f32::EPSILON {
            return;
        }
        for chan in 0..bus.channel_count() {
            mixer::apply_gain_ramp(bus.channel_mut(chan, nframes), from, to);
        }
    }
}

impl Default for GainEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

/// A plain static gain stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GainPlugin {
    pub gain: f32,
    pub bypassed: bool,
}

impl GainPlugin {
    pub fn new(gain: f32) -> Self {
        GainPlugin {
            gain,
            bypassed: false,
        }
    }

    fn process(&mut self, bus: &mut AudioBus, nframes: usize) {
        if self.bypassed {
            return;
        }
        for chan in 0..bus.channel_count() {
            mixer::apply_gain_to_buffer(bus.channel_mut(chan, nframes), self.gain);
        }
    }
}

/// Tagged variant over the available effect nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Plugin {
    GainEnvelope(GainEnvelope),
    Gain(GainPlugin),
}

impl Plugin {
    pub fn type_name(&self) -> &'static str {
        match self {
            Plugin::GainEnvelope(_) => "GainEnvelope",
            Plugin::Gain(_) => "Gain",
        }
    }

    fn process(&mut self, bus: &mut AudioBus, nframes: usize, ctx: ProcessContext) {
        match self {
            Plugin::GainEnvelope(envelope) => envelope.process(bus, nframes, ctx),
            Plugin::Gain(gain) => gain.process(bus, nframes),
        }
    }
}

/// Error returned when a structural edit is rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum ChainEditError {
    /// The gain envelope is not removable.
    FaderNotRemovable,
    /// Index out of bounds.
    NoSuchPlugin,
}

impl std::fmt::Display for ChainEditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainEditError::FaderNotRemovable => {
                write!(f, "Gain Envelope (Fader) is not removable")
            }
            ChainEditError::NoSuchPlugin => write!(f, "no such plugin"),
        }
    }
}

/// Ordered effect chain with the gain envelope as its anchor.
#[derive(Debug, Clone)]
pub struct PluginChain {
    plugins: Vec<Plugin>,
    fader_index: usize,
}

impl PluginChain {
    /// A new chain contains exactly the gain envelope.
    pub fn new() -> Self {
        PluginChain {
            plugins: vec![Plugin::GainEnvelope(GainEnvelope::new())],
            fader_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the fader is always present
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    /// The distinguished gain envelope.
    pub fn fader(&self) -> &GainEnvelope {
        match &self.plugins[self.fader_index] {
            Plugin::GainEnvelope(envelope) => envelope,
            _ => unreachable!("fader index must point at the gain envelope"),
        }
    }

    pub fn fader_mut(&mut self) -> &mut GainEnvelope {
        match &mut self.plugins[self.fader_index] {
            Plugin::GainEnvelope(envelope) => envelope,
            _ => unreachable!("fader index must point at the gain envelope"),
        }
    }

    /// Append a node before or after the fader.
    pub fn add_plugin(&mut self, plugin: Plugin, pre_fader: bool) {
        if pre_fader {
            self.plugins.insert(self.fader_index, plugin);
            self.fader_index += 1;
        } else {
            self.plugins.push(plugin);
        }
    }

    /// Remove a node by index; the fader is refused.
    pub fn remove_plugin(&mut self, index: usize) -> Result<Plugin, ChainEditError> {
        if index >= self.plugins.len() {
            return Err(ChainEditError::NoSuchPlugin);
        }
        if index == self.fader_index {
            return Err(ChainEditError::FaderNotRemovable);
        }
        let plugin = self.plugins.remove(index);
        if index < self.fader_index {
            self.fader_index -= 1;
        }
        Ok(plugin)
    }

    /// Run the nodes before the envelope.
    pub fn process_pre_fader(&mut self, bus: &mut AudioBus, nframes: usize, ctx: ProcessContext) {
        let fader_index = self.fader_index;
        for plugin in &mut self.plugins[..fader_index] {
            plugin.process(bus, nframes, ctx);
        }
    }

    /// Apply the envelope itself.
    pub fn process_fader(&mut self, bus: &mut AudioBus, nframes: usize, ctx: ProcessContext) {
        self.fader_mut().process(bus, nframes, ctx);
    }

    /// Run the nodes after the envelope.
    pub fn process_post_fader(&mut self, bus: &mut AudioBus, nframes: usize, ctx: ProcessContext) {
        let fader_index = self.fader_index;
        for plugin in &mut self.plugins[fader_index + 1..] {
            plugin.process(bus, nframes, ctx);
        }
    }
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::new()
    }
}
