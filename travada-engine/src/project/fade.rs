//! Clip fade curves
//!
//! A fade is a small control-point curve in the unit square, re-derived
//! whenever its shape parameters change, then evaluated per frame while
//! the clip renders. Fades live in clip-range time: a fade-in covers
//! `[0, range]` from the clip's left edge, a fade-out the mirror at the
//! right edge, and resizing the clip moves the fade with its edge.

use crate::engine::bus::AudioBus;
use travada_common::TimeRef;

/// Which clip edge the fade hangs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeType {
    FadeIn,
    FadeOut,
}

/// How bend/strength map onto the curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeMode {
    /// Power curve pulled toward fast or slow by the bend factor.
    Bend,
    /// Cosine S-curve.
    SCurve,
}

/// Named shape presets mapping to (mode, bend, strength).
pub const FADE_SHAPES: [(&str, FadeMode, f64, f64); 4] = [
    ("Fast", FadeMode::Bend, -0.8, 1.0),
    ("Linear", FadeMode::Bend, 0.0, 0.0),
    ("S-Shape", FadeMode::SCurve, 0.0, 1.0),
    ("Long", FadeMode::Bend, 0.8, 1.0),
];

/// Grid used when the raster flag snaps range edits (100 ms).
const RASTER_GRID: TimeRef = TimeRef::from_ms(100);

/// Most control points a derived curve carries.
const MAX_CONTROL_POINTS: usize = 7;

/// A fade-in or fade-out attached to one clip edge.
#[derive(Debug, Clone)]
pub struct FadeCurve {
    fade_type: FadeType,
    range: TimeRef,
    mode: FadeMode,
    bend: f64,
    strength: f64,
    raster: bool,
    bypassed: bool,
    /// Unit-square control points, monotonic in both axes.
    control_points: Vec<(f64, f64)>,
}

impl FadeCurve {
    pub fn new(fade_type: FadeType) -> Self {
        let mut fade = FadeCurve {
            fade_type,
            range: TimeRef::from_ms(500),
            mode: FadeMode::Bend,
            bend: 0.0,
            strength: 0.0,
            raster: false,
            bypassed: false,
            control_points: Vec::new(),
        };
        fade.set_shape("Fast");
        fade
    }

    pub fn fade_type(&self) -> FadeType {
        self.fade_type
    }

    pub fn range(&self) -> TimeRef {
        self.range
    }

    pub fn bend(&self) -> f64 {
        self.bend
    }

    pub fn strength(&self) -> f64 {
        self.strength
    }

    pub fn mode(&self) -> FadeMode {
        self.mode
    }

    pub fn raster(&self) -> bool {
        self.raster
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn control_points(&self) -> &[(f64, f64)] {
        &self.control_points
    }

    /// Set the fade length. With the raster flag on, the edit snaps to
    /// the raster grid (but never to zero).
    pub fn set_range(&mut self, range: TimeRef) {
        let range = range.max_zero();
        self.range = if self.raster {
            let grid = RASTER_GRID.universal();
            let snapped = (range.universal() + grid / 2) / grid * grid;
            TimeRef::new(snapped.max(grid))
        } else {
            range
        };
    }

    pub fn set_raster(&mut self, raster: bool) {
        self.raster = raster;
    }

    pub fn set_mode(&mut self, mode: FadeMode) {
        self.mode = mode;
        self.solve_node_positions();
    }

    pub fn set_bend_factor(&mut self, bend: f64) {
        self.bend = bend.clamp(-1.0, 1.0);
        self.solve_node_positions();
    }

    pub fn set_strength_factor(&mut self, strength: f64) {
        self.strength = strength.clamp(0.0, 1.0);
        self.solve_node_positions();
    }

    /// Apply a named preset; unknown names fall back to "Linear".
    pub fn set_shape(&mut self, name: &str) {
        let (_, mode, bend, strength) = FADE_SHAPES
            .iter()
            .find(|(shape, ..)| *shape == name)
            .copied()
            .unwrap_or(FADE_SHAPES[1]);
        self.mode = mode;
        self.bend = bend;
        self.strength = strength;
        self.solve_node_positions();
    }

    /// The raw shape function in the unit square.
    fn shape_value(&self, progress: f64) -> f64 {
        let p = progress.clamp(0.0, 1.0);
        let shaped = match self.mode {
            FadeMode::Bend => {
                // bend < 0: fast start; bend > 0: slow start.
                let exponent = 4.0f64.powf(self.bend);
                p.powf(exponent)
            }
            FadeMode::SCurve => (1.0 - (std::f64::consts::PI * p).cos()) / 2.0,
        };
        ((1.0 - self.strength) * p + self.strength * shaped).clamp(0.0, 1.0)
    }

    /// Re-derive the control polygon from the shape parameters.
    fn solve_node_positions(&mut self) {
        self.control_points.clear();
        let count = MAX_CONTROL_POINTS.min(5);
        for i in 0..count {
            let p = i as f64 / (count - 1) as f64;
            self.control_points.push((p, self.shape_value(p)));
        }
        // Endpoints are exact by contract.
        self.control_points[0] = (0.0, 0.0);
        let last = self.control_points.len() - 1;
        self.control_points[last] = (1.0, 1.0);
    }

    /// Evaluate the derived control polygon at `progress` in [0, 1].
    fn value_at(&self, progress: f64) -> f32 {
        let p = progress.clamp(0.0, 1.0);
        let points = &self.control_points;
        for window in points.windows(2) {
            let (x0, y0) = window[0];
            let (x1, y1) = window[1];
            if p <= x1 {
                let t = if x1 > x0 { (p - x0) / (x1 - x0) } else { 1.0 };
                return (y0 + (y1 - y0) * t) as f32;
            }
        }
        1.0
    }

    /// Multiply the fade onto the first `nframes` frames of `bus`.
    ///
    /// `clip_offset` is where the cycle's first frame sits in clip-range
    /// time (0 = clip's left edge); `clip_length` is the clip's current
    /// length, needed to anchor a fade-out at the right edge.
    pub fn process(
        &self,
        bus: &mut AudioBus,
        clip_offset: TimeRef,
        clip_length: TimeRef,
        nframes: usize,
        rate: u32,
    ) {
        if self.bypassed || self.range <= TimeRef::ZERO || nframes == 0 {
            return;
        }
        let range = self.range.universal() as f64;
        let frame_step = travada_common::UNIVERSAL_RATE as f64 / rate as f64;
        let base = clip_offset.universal() as f64;
        let clip_len = clip_length.universal() as f64;

        for chan in 0..bus.channel_count() {
            let data = bus.channel_mut(chan, nframes);
            match self.fade_type {
                FadeType::FadeIn => {
                    for (i, sample) in data.iter_mut().enumerate() {
                        let pos = base + i as f64 * frame_step;
                        if pos >= range {
                            break;
                        }
                        *sample *= self.value_at(pos / range);
                    }
                }
                FadeType::FadeOut => {
                    for (i, sample) in data.iter_mut().enumerate() {
                        let pos = base + i as f64 * frame_step;
                        let from_end = clip_len - pos;
                        if from_end > range {
                            continue;
                        }
                        *sample *= self.value_at((from_end / range).max(0.0));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bus(channels: usize, frames: usize) -> AudioBus {
        let mut bus = AudioBus::new("fade", channels, frames);
        for chan in 0..channels {
            bus.channel_mut(chan, frames).fill(1.0);
        }
        bus
    }

    #[test]
    fn linear_fade_in_profile() {
        let mut fade = FadeCurve::new(FadeType::FadeIn);
        fade.set_shape("Linear");
        fade.set_range(TimeRef::ONE_SECOND);

        let rate = 48_000;
        let mut bus = full_bus(2, 4);
        // Process the cycle that straddles the middle of the fade.
        fade.process(
            &mut bus,
            TimeRef::from_ms(500),
            TimeRef::from_ms(10_000),
            4,
            rate,
        );
        assert!((bus.channel(0, 1)[0] - 0.5).abs() < 1e-4);
        assert!((bus.channel(1, 1)[0] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn fade_in_boundaries() {
        let mut fade = FadeCurve::new(FadeType::FadeIn);
        fade.set_shape("Linear");
        fade.set_range(TimeRef::ONE_SECOND);
        let rate = 48_000;

        // At the clip edge, gain is zero.
        let mut bus = full_bus(1, 1);
        fade.process(&mut bus, TimeRef::ZERO, TimeRef::from_ms(10_000), 1, rate);
        assert!(bus.channel(0, 1)[0].abs() < 1e-6);

        // Past the fade range, samples are untouched.
        let mut bus = full_bus(1, 4);
        fade.process(
            &mut bus,
            TimeRef::from_ms(1500),
            TimeRef::from_ms(10_000),
            4,
            rate,
        );
        assert_eq!(bus.channel(0, 1)[0], 1.0);
    }

    #[test]
    fn fade_out_mirrors_at_clip_end() {
        let mut fade = FadeCurve::new(FadeType::FadeOut);
        fade.set_shape("Linear");
        fade.set_range(TimeRef::ONE_SECOND);
        let rate = 48_000;
        let clip_length = TimeRef::from_ms(4000);

        // Halfway into the fade-out (500 ms before the end): gain 0.5.
        let mut bus = full_bus(1, 1);
        fade.process(&mut bus, TimeRef::from_ms(3500), clip_length, 1, rate);
        assert!((bus.channel(0, 1)[0] - 0.5).abs() < 1e-4);

        // Before the fade-out starts: untouched.
        let mut bus = full_bus(1, 1);
        fade.process(&mut bus, TimeRef::from_ms(2000), clip_length, 1, rate);
        assert_eq!(bus.channel(0, 1)[0], 1.0);
    }

    #[test]
    fn presets_are_monotonic_in_unit_square() {
        for (name, ..) in FADE_SHAPES {
            let mut fade = FadeCurve::new(FadeType::FadeIn);
            fade.set_shape(name);
            let points = fade.control_points();
            assert!(points.len() >= 3 && points.len() <= 7, "{}", name);
            assert_eq!(points[0], (0.0, 0.0), "{}", name);
            assert_eq!(points[points.len() - 1], (1.0, 1.0), "{}", name);
            for window in points.windows(2) {
                assert!(window[1].0 > window[0].0, "{} time monotonic", name);
                assert!(window[1].1 >= window[0].1, "{} value monotonic", name);
            }
        }
    }

    #[test]
    fn fast_rises_faster_than_long() {
        let mut fast = FadeCurve::new(FadeType::FadeIn);
        fast.set_shape("Fast");
        let mut long = FadeCurve::new(FadeType::FadeIn);
        long.set_shape("Long");
        assert!(fast.value_at(0.25) > long.value_at(0.25));
    }

    #[test]
    fn raster_snaps_range() {
        let mut fade = FadeCurve::new(FadeType::FadeIn);
        fade.set_raster(true);
        fade.set_range(TimeRef::from_ms(437));
        assert_eq!(fade.range(), TimeRef::from_ms(400));
        // Never snaps to zero.
        fade.set_range(TimeRef::from_ms(10));
        assert_eq!(fade.range(), TimeRef::from_ms(100));
    }

    #[test]
    fn bypassed_fade_is_identity() {
        let mut fade = FadeCurve::new(FadeType::FadeIn);
        fade.set_range(TimeRef::ONE_SECOND);
        fade.set_bypassed(true);
        let mut bus = full_bus(1, 8);
        fade.process(&mut bus, TimeRef::ZERO, TimeRef::from_ms(5000), 8, 48_000);
        assert!(bus.channel(0, 8).iter().all(|s| *s == 1.0));
    }
}
