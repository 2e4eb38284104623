//! Sony Wave64 container support
//!
//! Wave64 is RIFF/WAVE with 16-byte GUID chunk ids and 64-bit sizes, used
//! for captures that may outgrow the 4 GB RIFF limit. Chunk sizes include
//! the 24-byte chunk header and chunks are aligned to 8 bytes.
//!
//! Only what captures need is implemented: one `fmt ` chunk (integer or
//! float PCM) and one `data` chunk.

use crate::error::{DecodeError, EncodeError, EngineError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// GUID chunk ids: the familiar FOURCC in the first four bytes, a fixed
/// suffix in the rest.
const RIFF_GUID: [u8; 16] = [
    0x72, 0x69, 0x66, 0x66, 0x2E, 0x91, 0xCF, 0x11, 0xA5, 0xD6, 0x28, 0xDB, 0x04, 0xC1, 0x00, 0x00,
];
const WAVE_GUID: [u8; 16] = [
    0x77, 0x61, 0x76, 0x65, 0xF3, 0xAC, 0xD3, 0x11, 0x8C, 0xD1, 0x00, 0xC0, 0x4F, 0x8E, 0xDB, 0x8A,
];
const FMT_GUID: [u8; 16] = [
    0x66, 0x6D, 0x74, 0x20, 0xF3, 0xAC, 0xD3, 0x11, 0x8C, 0xD1, 0x00, 0xC0, 0x4F, 0x8E, 0xDB, 0x8A,
];
const DATA_GUID: [u8; 16] = [
    0x64, 0x61, 0x74, 0x61, 0xF3, 0xAC, 0xD3, 0x11, 0x8C, 0xD1, 0x00, 0xC0, 0x4F, 0x8E, 0xDB, 0x8A,
];

const CHUNK_HEADER_BYTES: u64 = 24;
const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Wave64 PCM reader.
pub struct W64FileReader {
    file: BufReader<File>,
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    block_align: u16,
    data_offset: u64,
    frames: i64,
    pos: i64,
    read_buf: Vec<u8>,
}

impl W64FileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let probe_error = |reason: String| {
            EngineError::Decode(DecodeError::ProbeFailure {
                reason: format!("{}: {}", path.display(), reason),
            })
        };

        let mut file = BufReader::new(File::open(path)?);

        let mut guid = [0u8; 16];
        file.read_exact(&mut guid)?;
        if guid != RIFF_GUID {
            return Err(probe_error("not a Wave64 file".into()));
        }
        let mut size = [0u8; 8];
        file.read_exact(&mut size)?;
        file.read_exact(&mut guid)?;
        if guid != WAVE_GUID {
            return Err(probe_error("missing wave GUID".into()));
        }

        let mut format_tag = 0u16;
        let mut channels = 0u16;
        let mut sample_rate = 0u32;
        let mut bits_per_sample = 0u16;
        let mut block_align = 0u16;
        let mut data: Option<(u64, u64)> = None;

        // Walk chunks until the data chunk turns up.
        loop {
            if file.read_exact(&mut guid).is_err() {
                break;
            }
            file.read_exact(&mut size)?;
            let chunk_size = u64::from_le_bytes(size);
            if chunk_size < CHUNK_HEADER_BYTES {
                return Err(probe_error("chunk size smaller than its header".into()));
            }
            let body = chunk_size - CHUNK_HEADER_BYTES;

            if guid == FMT_GUID {
                let mut fmt = [0u8; 16];
                file.read_exact(&mut fmt)?;
                format_tag = u16::from_le_bytes([fmt[0], fmt[1]]);
                channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                block_align = u16::from_le_bytes([fmt[12], fmt[13]]);
                bits_per_sample = u16::from_le_bytes([fmt[14], fmt[15]]);
                let skip = align8(body) - 16;
                file.seek(SeekFrom::Current(skip as i64))?;
            } else if guid == DATA_GUID {
                let offset = file.stream_position()?;
                data = Some((offset, body));
                break;
            } else {
                file.seek(SeekFrom::Current(align8(body) as i64))?;
            }
        }

        let (data_offset, data_bytes) =
            data.ok_or_else(|| probe_error("no data chunk".into()))?;
        if channels == 0 {
            return Err(EngineError::Decode(DecodeError::ZeroChannels {
                path: path.display().to_string(),
            }));
        }
        if format_tag != WAVE_FORMAT_PCM && format_tag != WAVE_FORMAT_IEEE_FLOAT {
            return Err(probe_error(format!("unsupported format tag {}", format_tag)));
        }
        if block_align == 0 {
            block_align = channels * (bits_per_sample / 8);
        }
        let frames = (data_bytes / block_align as u64) as i64;

        file.seek(SeekFrom::Start(data_offset))?;

        Ok(W64FileReader {
            file,
            format_tag,
            channels,
            sample_rate,
            bits_per_sample,
            block_align,
            data_offset,
            frames,
            pos: 0,
            read_buf: Vec::new(),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> i64 {
        self.frames
    }

    pub fn pos(&self) -> i64 {
        self.pos
    }

    pub fn seek(&mut self, frame: i64) -> Result<bool> {
        if frame >= self.frames {
            return Ok(false);
        }
        self.file.seek(SeekFrom::Start(
            self.data_offset + frame as u64 * self.block_align as u64,
        ))?;
        self.pos = frame;
        Ok(true)
    }

    pub fn read(&mut self, buf: &mut super::reader::DecodeBuffer, count: usize) -> Result<usize> {
        let channels = self.channels as usize;
        let count = count.min((self.frames - self.pos).max(0) as usize);
        if count == 0 {
            return Ok(0);
        }
        buf.ensure_capacity(channels, count);

        let bytes = count * self.block_align as usize;
        self.read_buf.resize(bytes, 0);
        self.file.read_exact(&mut self.read_buf)?;

        let sample_bytes = (self.bits_per_sample / 8) as usize;
        for frame in 0..count {
            for chan in 0..channels {
                let at = (frame * channels + chan) * sample_bytes;
                let raw = &self.read_buf[at..at + sample_bytes];
                let value = match (self.format_tag, self.bits_per_sample) {
                    (WAVE_FORMAT_IEEE_FLOAT, 32) => {
                        f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
                    }
                    (WAVE_FORMAT_PCM, 16) => {
                        i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32_768.0
                    }
                    (WAVE_FORMAT_PCM, 24) => {
                        let v = i32::from_le_bytes([0, raw[0], raw[1], raw[2]]) >> 8;
                        v as f32 / 8_388_608.0
                    }
                    (WAVE_FORMAT_PCM, 32) => {
                        i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32
                            / 2_147_483_648.0
                    }
                    _ => {
                        return Err(EngineError::Decode(DecodeError::CorruptedData {
                            reason: format!(
                                "unsupported Wave64 sample layout: tag {} bits {}",
                                self.format_tag, self.bits_per_sample
                            ),
                        }))
                    }
                };
                buf.channel_mut(chan)[frame] = value;
            }
        }

        self.pos += count as i64;
        Ok(count)
    }
}

/// Wave64 PCM writer. Headers carry placeholder sizes until
/// [`W64FileWriter::finalize`] patches them.
pub struct W64FileWriter {
    file: BufWriter<File>,
    channels: u16,
    bytes_per_sample: u16,
    data_bytes: u64,
    finalized: bool,
}

impl W64FileWriter {
    pub fn create(
        path: &Path,
        channels: u16,
        sample_rate: u32,
        bits_per_sample: u16,
        float: bool,
    ) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            EngineError::Encode(EncodeError::CreateFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        let mut file = BufWriter::new(file);

        let bytes_per_sample = bits_per_sample / 8;
        let block_align = channels * bytes_per_sample;
        let byte_rate = sample_rate * block_align as u32;
        let format_tag = if float {
            WAVE_FORMAT_IEEE_FLOAT
        } else {
            WAVE_FORMAT_PCM
        };

        file.write_all(&RIFF_GUID)?;
        file.write_all(&0u64.to_le_bytes())?; // riff size, patched on finalize
        file.write_all(&WAVE_GUID)?;

        file.write_all(&FMT_GUID)?;
        file.write_all(&(CHUNK_HEADER_BYTES + 16).to_le_bytes())?;
        file.write_all(&format_tag.to_le_bytes())?;
        file.write_all(&channels.to_le_bytes())?;
        file.write_all(&sample_rate.to_le_bytes())?;
        file.write_all(&byte_rate.to_le_bytes())?;
        file.write_all(&block_align.to_le_bytes())?;
        file.write_all(&bits_per_sample.to_le_bytes())?;

        file.write_all(&DATA_GUID)?;
        file.write_all(&0u64.to_le_bytes())?; // data size, patched on finalize

        Ok(W64FileWriter {
            file,
            channels,
            bytes_per_sample,
            data_bytes: 0,
            finalized: false,
        })
    }

    pub fn write_i16(&mut self, sample: i16) -> Result<()> {
        debug_assert_eq!(self.bytes_per_sample, 2);
        self.file.write_all(&sample.to_le_bytes())?;
        self.data_bytes += 2;
        Ok(())
    }

    pub fn write_i24(&mut self, sample: i32) -> Result<()> {
        debug_assert_eq!(self.bytes_per_sample, 3);
        let bytes = sample.to_le_bytes();
        self.file.write_all(&bytes[..3])?;
        self.data_bytes += 3;
        Ok(())
    }

    pub fn write_f32(&mut self, sample: f32) -> Result<()> {
        debug_assert_eq!(self.bytes_per_sample, 4);
        self.file.write_all(&sample.to_le_bytes())?;
        self.data_bytes += 4;
        Ok(())
    }

    pub fn frames_written(&self) -> i64 {
        (self.data_bytes / (self.channels as u64 * self.bytes_per_sample as u64)) as i64
    }

    /// Pad the data chunk, patch both sizes and flush.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let padding = align8(self.data_bytes) - self.data_bytes;
        for _ in 0..padding {
            self.file.write_all(&[0u8])?;
        }

        let finish_error = |e: std::io::Error| {
            EngineError::Encode(EncodeError::FinishFailed {
                reason: e.to_string(),
            })
        };

        let riff_size = 40 + (CHUNK_HEADER_BYTES + 16) + CHUNK_HEADER_BYTES
            + align8(self.data_bytes);
        self.file.flush().map_err(finish_error)?;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(16)).map_err(finish_error)?;
        file.write_all(&riff_size.to_le_bytes()).map_err(finish_error)?;
        // data size field sits right after the data GUID.
        let data_size_at = 40 + CHUNK_HEADER_BYTES + 16 + 16;
        file.seek(SeekFrom::Start(data_size_at)).map_err(finish_error)?;
        file.write_all(&(CHUNK_HEADER_BYTES + self.data_bytes).to_le_bytes())
            .map_err(finish_error)?;
        file.flush().map_err(finish_error)?;

        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audiofile::reader::DecodeBuffer;

    #[test]
    fn write_read_round_trip_f32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.w64");

        let mut writer = W64FileWriter::create(&path, 2, 48_000, 32, true).unwrap();
        for frame in 0..100 {
            writer.write_f32(frame as f32 / 100.0).unwrap();
            writer.write_f32(-(frame as f32) / 100.0).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = W64FileReader::open(&path).unwrap();
        assert_eq!(reader.channel_count(), 2);
        assert_eq!(reader.sample_rate(), 48_000);
        assert_eq!(reader.frames(), 100);

        let mut buf = DecodeBuffer::new();
        let read = reader.read(&mut buf, 100).unwrap();
        assert_eq!(read, 100);
        assert!((buf.channel(0)[50] - 0.5).abs() < 1e-6);
        assert!((buf.channel(1)[50] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn write_read_round_trip_i16_with_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take16.w64");

        let mut writer = W64FileWriter::create(&path, 1, 44_100, 16, false).unwrap();
        for frame in 0..1000i32 {
            writer.write_i16((frame - 500) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = W64FileReader::open(&path).unwrap();
        assert!(reader.seek(600).unwrap());
        let mut buf = DecodeBuffer::new();
        reader.read(&mut buf, 1).unwrap();
        assert!((buf.channel(0)[0] - 100.0 / 32_768.0).abs() < 1e-6);
    }

    #[test]
    fn seek_past_eof_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.w64");
        let mut writer = W64FileWriter::create(&path, 1, 44_100, 32, true).unwrap();
        writer.write_f32(0.1).unwrap();
        writer.finalize().unwrap();

        let mut reader = W64FileReader::open(&path).unwrap();
        assert!(!reader.seek(5).unwrap());
    }
}
