//! Dither for word-length reduction
//!
//! Float samples quantized to 16-bit get triangular-PDF dither scaled to
//! one LSB of the target depth; 24-bit and float output is written
//! undithered. The noise generator is seeded from a digest of the output
//! file path, so re-rendering the same file is bit-identical.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use travada_common::config::BitDepth;

/// Dither flavors selectable in an export specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DitherMode {
    /// No dither (always used for 24-bit and float output)
    None,
    /// Triangular PDF, one LSB peak-to-peak amplitude
    Triangular,
}

/// Stateful quantizer used by the write path.
#[derive(Debug)]
pub struct Dither {
    mode: DitherMode,
    rng: SmallRng,
}

impl Dither {
    /// Default mode for a target depth: triangular for 16-bit, none
    /// otherwise.
    pub fn default_mode(depth: BitDepth) -> DitherMode {
        match depth {
            BitDepth::Int16 => DitherMode::Triangular,
            BitDepth::Int24 | BitDepth::Float32 => DitherMode::None,
        }
    }

    /// Build a quantizer seeded from the output file path.
    pub fn for_output(mode: DitherMode, path: &Path) -> Self {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        Dither {
            mode,
            rng: SmallRng::seed_from_u64(u64::from_le_bytes(seed)),
        }
    }

    /// Quantize a [-1, 1] float sample to i16 with dither.
    ///
    /// Scale convention is 2^15 on both the write and read side (readers
    /// divide by 32768), so quantize/dequantize round-trips exactly for
    /// representable values.
    pub fn quantize_i16(&mut self, sample: f32) -> i16 {
        let scaled = sample as f64 * 32768.0;
        let dithered = match self.mode {
            DitherMode::None => scaled,
            DitherMode::Triangular => {
                // Difference of two uniforms: triangular in (-1, 1) LSB.
                let noise: f64 = self.rng.gen::<f64>() - self.rng.gen::<f64>();
                scaled + noise
            }
        };
        dithered.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }

    /// Quantize a [-1, 1] float sample to a 24-bit value in an i32.
    pub fn quantize_i24(&mut self, sample: f32) -> i32 {
        (sample as f64 * 8_388_608.0)
            .round()
            .clamp(-8_388_608.0, 8_388_607.0) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_same_noise() {
        let path = Path::new("/tmp/out.wav");
        let mut a = Dither::for_output(DitherMode::Triangular, path);
        let mut b = Dither::for_output(DitherMode::Triangular, path);
        for i in 0..1000 {
            let s = (i as f32 / 1000.0).sin() * 0.5;
            assert_eq!(a.quantize_i16(s), b.quantize_i16(s));
        }
    }

    #[test]
    fn dither_error_stays_within_one_lsb() {
        let mut d = Dither::for_output(DitherMode::Triangular, Path::new("x.wav"));
        for i in 0..10_000 {
            let s = ((i as f32) * 0.001).sin() * 0.9;
            let q = d.quantize_i16(s);
            let err = (q as f64 - s as f64 * 32768.0).abs();
            assert!(err <= 1.5, "error {} at sample {}", err, i);
        }
    }

    #[test]
    fn dc_bias_is_negligible() {
        let mut d = Dither::for_output(DitherMode::Triangular, Path::new("bias.wav"));
        let input = 0.25f32;
        let n = 200_000;
        let sum: i64 = (0..n).map(|_| d.quantize_i16(input) as i64).sum();
        let mean = sum as f64 / n as f64;
        let expected = input as f64 * 32768.0;
        assert!(
            (mean - expected).abs() < 0.5,
            "mean {} vs expected {}",
            mean,
            expected
        );
    }

    #[test]
    fn undithered_full_scale_clamps() {
        let mut d = Dither::for_output(DitherMode::None, Path::new("c.wav"));
        assert_eq!(d.quantize_i16(1.5), i16::MAX);
        assert_eq!(d.quantize_i16(-1.5), i16::MIN);
        assert_eq!(d.quantize_i24(1.0), 8_388_607);
    }
}
