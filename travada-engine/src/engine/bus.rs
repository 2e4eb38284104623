//! Planar audio buses
//!
//! An [`AudioBus`] is a fixed-capacity planar scratch buffer: one `Vec<f32>`
//! per channel, allocated up front. Buses are pre-allocated by their owners
//! (tracks, the sheet, the device layer) before the realtime thread runs;
//! nothing here allocates on the audio path.

/// A planar, fixed-capacity audio buffer.
#[derive(Debug)]
pub struct AudioBus {
    name: String,
    channels: Vec<Vec<f32>>,
    capacity: usize,
}

impl AudioBus {
    /// Allocate a bus with `channel_count` channels of `capacity` frames.
    pub fn new(name: impl Into<String>, channel_count: usize, capacity: usize) -> Self {
        AudioBus {
            name: name.into(),
            channels: vec![vec![0.0; capacity]; channel_count],
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames each channel can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The first `nframes` frames of a channel.
    pub fn channel(&self, chan: usize, nframes: usize) -> &[f32] {
        debug_assert!(nframes <= self.capacity);
        &self.channels[chan][..nframes]
    }

    /// Mutable view of the first `nframes` frames of a channel.
    pub fn channel_mut(&mut self, chan: usize, nframes: usize) -> &mut [f32] {
        debug_assert!(nframes <= self.capacity);
        &mut self.channels[chan][..nframes]
    }

    /// Mutable views of two distinct channels at once (mixing helper).
    pub fn two_channels_mut(
        &mut self,
        a: usize,
        b: usize,
        nframes: usize,
    ) -> (&mut [f32], &mut [f32]) {
        debug_assert!(a != b);
        debug_assert!(nframes <= self.capacity);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.channels.split_at_mut(hi);
        let first = &mut left[lo][..nframes];
        let second = &mut right[0][..nframes];
        if a < b {
            (first, second)
        } else {
            (second, first)
        }
    }

    /// Zero the first `nframes` frames of every channel.
    pub fn silence(&mut self, nframes: usize) {
        let nframes = nframes.min(self.capacity);
        for chan in &mut self.channels {
            chan[..nframes].fill(0.0);
        }
    }

    /// Copy another bus into this one (same channel count assumed).
    pub fn copy_from(&mut self, other: &AudioBus, nframes: usize) {
        debug_assert_eq!(self.channel_count(), other.channel_count());
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst[..nframes].copy_from_slice(&src[..nframes]);
        }
    }
}
