//! Streaming sample-rate conversion built on rubato
//!
//! Two wrappers over the same polynomial resampler, one per data-flow
//! direction:
//!
//! - [`OutputDrivenResampler`] delivers an exact number of output frames
//!   per call and reports how many input frames it needs next. Used on the
//!   read path, where ring slots demand fixed frame counts at the device
//!   rate.
//! - [`InputDrivenResampler`] accepts fixed input chunks and yields
//!   whatever output falls out, with a flush for held-back frames. Used on
//!   the write path, where capture delivers device-rate blocks.
//!
//! Both preserve filter state across calls so chunk boundaries are
//! seamless.

use crate::error::{DecodeError, EngineError, Result};
use rubato::{FastFixedIn, FastFixedOut, PolynomialDegree, Resampler};

fn resample_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Decode(DecodeError::Resampling {
        reason: e.to_string(),
    })
}

/// Fixed-output-size resampler for the read path.
pub enum OutputDrivenResampler {
    /// Rates match; input passes through untouched.
    PassThrough,
    Active {
        resampler: FastFixedOut<f32>,
        input_rate: u32,
        output_rate: u32,
        channels: usize,
    },
}

impl OutputDrivenResampler {
    /// `chunk_frames` is the number of output frames produced per
    /// [`OutputDrivenResampler::process`] call.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(OutputDrivenResampler::PassThrough);
        }
        tracing::debug!(
            "Creating output-driven resampler: {}Hz -> {}Hz ({} channels, chunk {})",
            input_rate,
            output_rate,
            channels,
            chunk_frames
        );
        let resampler = FastFixedOut::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            chunk_frames,
            channels,
        )
        .map_err(resample_error)?;
        Ok(OutputDrivenResampler::Active {
            resampler,
            input_rate,
            output_rate,
            channels,
        })
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, OutputDrivenResampler::PassThrough)
    }

    /// Input frames the next [`OutputDrivenResampler::process`] call wants.
    /// For a pass-through this equals the output chunk, which the caller
    /// tracks itself.
    pub fn input_frames_next(&mut self) -> Option<usize> {
        match self {
            OutputDrivenResampler::PassThrough => None,
            OutputDrivenResampler::Active { resampler, .. } => Some(resampler.input_frames_next()),
        }
    }

    /// Convert one chunk. `input` must hold exactly the frame count the
    /// resampler asked for (zero-padded at end of file); returns
    /// `chunk_frames` planar output frames.
    pub fn process<V: AsRef<[f32]>>(&mut self, input: &[V]) -> Result<Vec<Vec<f32>>> {
        match self {
            OutputDrivenResampler::PassThrough => {
                Ok(input.iter().map(|c| c.as_ref().to_vec()).collect())
            }
            OutputDrivenResampler::Active { resampler, .. } => {
                resampler.process(input, None).map_err(resample_error)
            }
        }
    }

    /// Forget filter state after a seek.
    pub fn reset(&mut self) {
        if let OutputDrivenResampler::Active { resampler, .. } = self {
            resampler.reset();
        }
    }

    /// Output frames corresponding to a whole input stream of
    /// `input_frames`, truncating toward zero.
    pub fn output_length(&self, input_frames: i64) -> i64 {
        match self {
            OutputDrivenResampler::PassThrough => input_frames,
            OutputDrivenResampler::Active {
                input_rate,
                output_rate,
                ..
            } => (input_frames as i128 * *output_rate as i128 / *input_rate as i128) as i64,
        }
    }
}

/// Fixed-input-size resampler for the write path.
pub enum InputDrivenResampler {
    PassThrough,
    Active {
        resampler: FastFixedIn<f32>,
        chunk_frames: usize,
        channels: usize,
    },
}

impl InputDrivenResampler {
    /// `chunk_frames` is the input frame count every full
    /// [`InputDrivenResampler::process`] call must supply.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(InputDrivenResampler::PassThrough);
        }
        tracing::debug!(
            "Creating input-driven resampler: {}Hz -> {}Hz ({} channels, chunk {})",
            input_rate,
            output_rate,
            channels,
            chunk_frames
        );
        let resampler = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            chunk_frames,
            channels,
        )
        .map_err(resample_error)?;
        Ok(InputDrivenResampler::Active {
            resampler,
            chunk_frames,
            channels,
        })
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, InputDrivenResampler::PassThrough)
    }

    /// Convert one chunk of planar input. A short final chunk is accepted
    /// and processed through the partial-input path.
    pub fn process<V: AsRef<[f32]>>(&mut self, input: &[V]) -> Result<Vec<Vec<f32>>> {
        match self {
            InputDrivenResampler::PassThrough => {
                Ok(input.iter().map(|c| c.as_ref().to_vec()).collect())
            }
            InputDrivenResampler::Active {
                resampler,
                chunk_frames,
                ..
            } => {
                let frames = input.first().map(|c| c.as_ref().len()).unwrap_or(0);
                if frames == *chunk_frames {
                    resampler.process(input, None).map_err(resample_error)
                } else {
                    resampler
                        .process_partial(Some(input), None)
                        .map_err(resample_error)
                }
            }
        }
    }

    /// Drain frames still held in the filter. Call once, when the stream
    /// ends.
    pub fn flush(&mut self) -> Result<Vec<Vec<f32>>> {
        match self {
            InputDrivenResampler::PassThrough => Ok(Vec::new()),
            InputDrivenResampler::Active { resampler, .. } => resampler
                .process_partial::<Vec<f32>>(None, None)
                .map_err(resample_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_copies_input() {
        let mut rs = OutputDrivenResampler::new(48_000, 48_000, 2, 512).unwrap();
        assert!(rs.is_pass_through());
        let input = vec![vec![0.5f32; 512], vec![-0.5f32; 512]];
        let out = rs.process(&input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn output_driven_produces_fixed_chunks() {
        let chunk = 512;
        let mut rs = OutputDrivenResampler::new(48_000, 44_100, 1, chunk).unwrap();
        for _ in 0..5 {
            let need = rs.input_frames_next().unwrap();
            let input = vec![vec![0.25f32; need]];
            let out = rs.process(&input).unwrap();
            assert_eq!(out[0].len(), chunk);
        }
    }

    #[test]
    fn output_length_scales_by_ratio() {
        let rs = OutputDrivenResampler::new(48_000, 44_100, 1, 256).unwrap();
        assert_eq!(rs.output_length(48_000), 44_100);
        let rs = OutputDrivenResampler::new(44_100, 44_100, 1, 256).unwrap();
        assert_eq!(rs.output_length(1234), 1234);
    }

    #[test]
    fn input_driven_ratio_and_flush() {
        let chunk = 1024;
        let mut rs = InputDrivenResampler::new(48_000, 44_100, 2, chunk).unwrap();

        let mut produced = 0usize;
        let blocks = 20;
        for _ in 0..blocks {
            let input = vec![vec![0.1f32; chunk], vec![0.1f32; chunk]];
            let out = rs.process(&input).unwrap();
            produced += out[0].len();
        }
        let tail = rs.flush().unwrap();
        produced += tail.first().map(|c| c.len()).unwrap_or(0);

        let expected = blocks * chunk * 44_100 / 48_000;
        let diff = produced as i64 - expected as i64;
        // Filter delay keeps a handful of frames; the bulk must be there.
        assert!(diff.abs() < 256, "produced {}, expected ~{}", produced, expected);
    }

    #[test]
    fn input_driven_accepts_short_final_chunk() {
        let mut rs = InputDrivenResampler::new(96_000, 44_100, 1, 1024).unwrap();
        let full = vec![vec![0.2f32; 1024]];
        rs.process(&full).unwrap();
        let short = vec![vec![0.2f32; 100]];
        rs.process(&short).unwrap();
    }
}
