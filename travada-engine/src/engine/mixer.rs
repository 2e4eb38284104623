//! Buffer mix primitives
//!
//! Small free functions used on the realtime path. All of them operate on
//! caller-owned slices and never allocate.

/// `dst += src`, sample by sample.
pub fn mix_buffers_no_gain(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s;
    }
}

/// `dst += src * gain`.
pub fn mix_buffers_with_gain(dst: &mut [f32], src: &[f32], gain: f32) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s * gain;
    }
}

/// Scale a buffer in place.
pub fn apply_gain_to_buffer(buf: &mut [f32], gain: f32) {
    for s in buf.iter_mut() {
        *s *= gain;
    }
}

/// Apply a linear gain ramp from `from` to `to` across the buffer.
///
/// Used by the gain envelope: one envelope lookup per cycle, all
/// inter-sample movement interpolated here.
pub fn apply_gain_ramp(buf: &mut [f32], from: f32, to: f32) {
    if buf.is_empty() {
        return;
    }
    if (from - to).abs() < f32::EPSILON {
        apply_gain_to_buffer(buf, from);
        return;
    }
    let step = (to - from) / buf.len() as f32;
    let mut gain = from;
    for s in buf.iter_mut() {
        *s *= gain;
        gain += step;
    }
}

/// Running absolute maximum over a buffer.
pub fn compute_peak(buf: &[f32], current_max: f32) -> f32 {
    buf.iter().fold(current_max, |max, s| max.max(s.abs()))
}

/// Interleave planar channels into `out` (`[L, R, L, R, ...]`).
///
/// Returns the number of f32 values written.
pub fn interleave(channels: &[&[f32]], out: &mut [f32]) -> usize {
    if channels.is_empty() {
        return 0;
    }
    let nframes = channels[0].len();
    let nchan = channels.len();
    debug_assert!(out.len() >= nframes * nchan);
    for frame in 0..nframes {
        for (chan, data) in channels.iter().enumerate() {
            out[frame * nchan + chan] = data[frame];
        }
    }
    nframes * nchan
}

/// De-interleave `input` into planar channel buffers.
pub fn deinterleave(input: &[f32], channels: &mut [Vec<f32>]) {
    let nchan = channels.len();
    if nchan == 0 {
        return;
    }
    let nframes = input.len() / nchan;
    for chan in channels.iter_mut() {
        chan.clear();
        chan.reserve(nframes);
    }
    for frame in 0..nframes {
        for (chan, data) in channels.iter_mut().enumerate() {
            data.push(input[frame * nchan + chan]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_adds_in_place() {
        let mut dst = vec![0.1, 0.2];
        mix_buffers_no_gain(&mut dst, &[0.3, 0.4]);
        assert!((dst[0] - 0.4).abs() < 1e-6);
        assert!((dst[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn gain_ramp_is_linear() {
        let mut buf = vec![1.0f32; 4];
        apply_gain_ramp(&mut buf, 0.0, 1.0);
        assert_eq!(buf[0], 0.0);
        assert!((buf[1] - 0.25).abs() < 1e-6);
        assert!((buf[2] - 0.5).abs() < 1e-6);
        assert!((buf[3] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn constant_ramp_equals_plain_gain() {
        let mut buf = vec![0.5f32; 8];
        apply_gain_ramp(&mut buf, 0.5, 0.5);
        assert!(buf.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn compute_peak_tracks_absolute_max() {
        let peak = compute_peak(&[0.1, -0.9, 0.3], 0.5);
        assert!((peak - 0.9).abs() < 1e-6);
    }

    #[test]
    fn interleave_round_trip() {
        let left = vec![1.0, 3.0, 5.0];
        let right = vec![2.0, 4.0, 6.0];
        let mut out = vec![0.0; 6];
        interleave(&[&left, &right], &mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut planar = vec![Vec::new(), Vec::new()];
        deinterleave(&out, &mut planar);
        assert_eq!(planar[0], left);
        assert_eq!(planar[1], right);
    }
}
