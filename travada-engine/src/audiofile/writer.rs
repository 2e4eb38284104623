//! Audio file writers
//!
//! [`FileWriter`] is the tagged-variant encoder used by write sources:
//! RIFF/WAVE through hound, Wave64 through our own container code. The
//! writer owns quantization: callers hand it interleaved f32 frames and
//! the configured bit depth decides dithering (triangular for 16-bit,
//! none for 24-bit and float).

use crate::audiofile::dither::{Dither, DitherMode};
use crate::audiofile::w64::W64FileWriter;
use crate::error::{EncodeError, EngineError, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use travada_common::config::{BitDepth, RecordFormat};

fn write_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Encode(EncodeError::WriteFailed {
        reason: e.to_string(),
    })
}

enum WriterKind {
    Wav(Option<hound::WavWriter<BufWriter<File>>>),
    W64(W64FileWriter),
}

/// Streaming encoder for one output file.
pub struct FileWriter {
    kind: WriterKind,
    path: PathBuf,
    channels: u16,
    sample_rate: u32,
    depth: BitDepth,
    dither: Dither,
    frames_written: i64,
}

impl FileWriter {
    /// Create the output file and write its header.
    pub fn create(
        path: &Path,
        format: RecordFormat,
        channels: u16,
        sample_rate: u32,
        depth: BitDepth,
        dither_mode: DitherMode,
    ) -> Result<Self> {
        if channels == 0 {
            return Err(EngineError::Encode(EncodeError::InvalidSpec {
                reason: "cannot write a zero-channel file".to_string(),
            }));
        }

        let kind = match format {
            RecordFormat::Wav => {
                let spec = hound::WavSpec {
                    channels,
                    sample_rate,
                    bits_per_sample: depth.bits(),
                    sample_format: match depth {
                        BitDepth::Float32 => hound::SampleFormat::Float,
                        _ => hound::SampleFormat::Int,
                    },
                };
                let writer = hound::WavWriter::create(path, spec).map_err(|e| {
                    EngineError::Encode(EncodeError::CreateFailed {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })
                })?;
                WriterKind::Wav(Some(writer))
            }
            RecordFormat::W64 => WriterKind::W64(W64FileWriter::create(
                path,
                channels,
                sample_rate,
                depth.bits(),
                depth == BitDepth::Float32,
            )?),
        };

        Ok(FileWriter {
            kind,
            path: path.to_path_buf(),
            channels,
            sample_rate,
            depth,
            dither: Dither::for_output(dither_mode, path),
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channel_count(&self) -> usize {
        self.channels as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_written(&self) -> i64 {
        self.frames_written
    }

    /// Quantize and append interleaved frames.
    pub fn write_frames(&mut self, interleaved: &[f32]) -> Result<usize> {
        debug_assert_eq!(interleaved.len() % self.channels as usize, 0);
        let frames = interleaved.len() / self.channels as usize;

        match (&mut self.kind, self.depth) {
            (WriterKind::Wav(Some(writer)), BitDepth::Int16) => {
                for s in interleaved {
                    writer
                        .write_sample(self.dither.quantize_i16(*s))
                        .map_err(write_error)?;
                }
            }
            (WriterKind::Wav(Some(writer)), BitDepth::Int24) => {
                for s in interleaved {
                    writer
                        .write_sample(self.dither.quantize_i24(*s))
                        .map_err(write_error)?;
                }
            }
            (WriterKind::Wav(Some(writer)), BitDepth::Float32) => {
                for s in interleaved {
                    writer.write_sample(*s).map_err(write_error)?;
                }
            }
            (WriterKind::Wav(None), _) => {
                return Err(EngineError::Encode(EncodeError::WriteFailed {
                    reason: "writer already finalized".to_string(),
                }))
            }
            (WriterKind::W64(writer), BitDepth::Int16) => {
                for s in interleaved {
                    let q = self.dither.quantize_i16(*s);
                    writer.write_i16(q)?;
                }
            }
            (WriterKind::W64(writer), BitDepth::Int24) => {
                for s in interleaved {
                    let q = self.dither.quantize_i24(*s);
                    writer.write_i24(q)?;
                }
            }
            (WriterKind::W64(writer), BitDepth::Float32) => {
                for s in interleaved {
                    writer.write_f32(*s)?;
                }
            }
        }

        self.frames_written += frames as i64;
        Ok(frames)
    }

    /// Flush buffers and patch the header. Must be called exactly once
    /// when the stream ends; dropping an unfinalized writer loses the
    /// tail.
    pub fn finalize(&mut self) -> Result<()> {
        match &mut self.kind {
            WriterKind::Wav(writer) => {
                if let Some(writer) = writer.take() {
                    writer.finalize().map_err(|e| {
                        EngineError::Encode(EncodeError::FinishFailed {
                            reason: e.to_string(),
                        })
                    })?;
                }
                Ok(())
            }
            WriterKind::W64(writer) => writer.finalize(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audiofile::reader::{DecodeBuffer, FileReader};

    fn sine(frames: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin() * 0.5)
            .collect()
    }

    #[test]
    fn float_wav_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let input = sine(4096, 440.0, 44_100.0);

        let mut writer = FileWriter::create(
            &path,
            RecordFormat::Wav,
            1,
            44_100,
            BitDepth::Float32,
            DitherMode::None,
        )
        .unwrap();
        writer.write_frames(&input).unwrap();
        writer.finalize().unwrap();
        assert_eq!(writer.frames_written(), 4096);

        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.frames(), 4096);
        let mut buf = DecodeBuffer::new();
        reader.read(&mut buf, 4096).unwrap();
        for (a, b) in input.iter().zip(buf.channel(0)) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn dithered_i16_error_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sixteen.wav");
        let input = sine(8192, 997.0, 48_000.0);

        let mut writer = FileWriter::create(
            &path,
            RecordFormat::Wav,
            1,
            48_000,
            BitDepth::Int16,
            DitherMode::Triangular,
        )
        .unwrap();
        writer.write_frames(&input).unwrap();
        writer.finalize().unwrap();

        let mut reader = FileReader::open(&path).unwrap();
        let mut buf = DecodeBuffer::new();
        reader.read(&mut buf, 8192).unwrap();

        let lsb = 1.0 / 32_768.0;
        for (a, b) in input.iter().zip(buf.channel(0)) {
            assert!((a - b).abs() <= lsb * 1.01, "{} vs {}", a, b);
        }
    }

    #[test]
    fn w64_writer_is_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.w64");
        let input = sine(1024, 330.0, 44_100.0);

        let mut writer = FileWriter::create(
            &path,
            RecordFormat::W64,
            1,
            44_100,
            BitDepth::Float32,
            DitherMode::None,
        )
        .unwrap();
        writer.write_frames(&input).unwrap();
        writer.finalize().unwrap();

        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.frames(), 1024);
        assert_eq!(reader.file_rate(), 44_100);
    }

    #[test]
    fn zero_channels_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.wav");
        let result = FileWriter::create(
            &path,
            RecordFormat::Wav,
            0,
            44_100,
            BitDepth::Float32,
            DitherMode::None,
        );
        assert!(result.is_err());
    }
}
