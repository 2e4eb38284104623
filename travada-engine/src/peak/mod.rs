//! Peak files: pyramidal min/max caches for waveform display and
//! normalization
//!
//! One peak file per source channel, named `<sourcename>-chN.peak` in the
//! project's peak files directory. Layout (little-endian):
//!
//! ```text
//! magic "TRAVPF" (6)  version {1,4} (2)
//! level offsets  [i32; 15]   in pairs, relative to the data start
//! level sizes    [i32; 15]   in pairs
//! norm offset    i32         in bytes from file start
//! header size    i32         in bytes (136)
//! peak pyramids: i16 pairs (max, -min), levels 64 .. 2^20
//! norm values:   f32 absolute maxima per 10000 source frames
//! ```
//!
//! Level 0 holds one pair per 64 source frames *at 44.1 kHz equivalent*
//! (the bucket is a time span, so other file rates scale the frame
//! count); each level above decimates by two via pairwise max. Mins are
//! stored negated, which turns "most negative min" into a plain max.
//!
//! A peak file older than its audio source, or with a different
//! magic/version, is discarded and rebuilt.

pub mod builder;
pub mod processor;

use crate::audiofile::reader::{DecodeBuffer, FileReader};
use crate::engine::mixer;
use crate::error::{EngineError, PeakError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use travada_common::TimeRef;

pub const PEAK_MAGIC: &[u8; 6] = b"TRAVPF";
pub const PEAK_VERSION: [u8; 2] = [1, 4];

/// Cached zoom levels: 64, 128, ..., 2^20 frames per pair.
pub const CACHED_LEVELS: usize = 15;

/// Source frames per level-0 pair, at 44.1 kHz equivalent.
pub const LEVEL_ZERO_RANGE: i64 = 64;

/// Source frames per cached normalization value.
pub const NORMALIZE_CHUNK_SIZE: i64 = 10_000;

/// Scale factor between float samples and stored i16 peak values.
pub const MAX_PEAK_VALUE: f32 = 32_767.0;

/// Fixed header length in bytes.
pub const HEADER_BYTES: u64 = 6 + 2 + (CACHED_LEVELS as u64 * 4) * 2 + 4 + 4;

/// One stored peak data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakPair {
    pub max: i16,
    /// The bucket minimum, negated at store time.
    pub neg_min: i16,
}

impl PeakPair {
    /// Pairwise decimation: the parent of two pairs.
    pub fn merge(self, other: PeakPair) -> PeakPair {
        PeakPair {
            max: self.max.max(other.max),
            neg_min: self.neg_min.max(other.neg_min),
        }
    }
}

/// Parsed peak file header.
#[derive(Debug, Clone, Default)]
pub struct PeakHeader {
    /// Per-level start, in pairs from the data start.
    pub offsets: [i32; CACHED_LEVELS],
    /// Per-level length, in pairs.
    pub sizes: [i32; CACHED_LEVELS],
    /// Byte offset of the norm-value section.
    pub norm_offset: i32,
    pub header_size: i32,
}

impl PeakHeader {
    pub fn read_from(file: &mut File, path: &Path) -> Result<Self> {
        let incompatible = || {
            EngineError::Peak(PeakError::IncompatibleHeader {
                path: path.display().to_string(),
            })
        };

        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 6];
        file.read_exact(&mut magic).map_err(|_| incompatible())?;
        let mut version = [0u8; 2];
        file.read_exact(&mut version).map_err(|_| incompatible())?;
        if &magic != PEAK_MAGIC || version != PEAK_VERSION {
            return Err(incompatible());
        }

        let mut header = PeakHeader::default();
        let mut word = [0u8; 4];
        for offset in header.offsets.iter_mut() {
            file.read_exact(&mut word)?;
            *offset = i32::from_le_bytes(word);
        }
        for size in header.sizes.iter_mut() {
            file.read_exact(&mut word)?;
            *size = i32::from_le_bytes(word);
        }
        file.read_exact(&mut word)?;
        header.norm_offset = i32::from_le_bytes(word);
        file.read_exact(&mut word)?;
        header.header_size = i32::from_le_bytes(word);

        if header.header_size as u64 != HEADER_BYTES {
            return Err(incompatible());
        }
        Ok(header)
    }

    pub fn write_to(&self, file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        use std::io::Write;
        file.write_all(PEAK_MAGIC)?;
        file.write_all(&PEAK_VERSION)?;
        for offset in &self.offsets {
            file.write_all(&offset.to_le_bytes())?;
        }
        for size in &self.sizes {
            file.write_all(&size.to_le_bytes())?;
        }
        file.write_all(&self.norm_offset.to_le_bytes())?;
        file.write_all(&self.header_size.to_le_bytes())?;
        Ok(())
    }
}

/// Peak file name for one channel of a source.
pub fn peak_file_name(peakfiles_dir: &Path, source_path: &Path, channel: usize) -> PathBuf {
    let source_name = source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    peakfiles_dir.join(format!("{}-ch{}.peak", source_name, channel))
}

/// The zoom level whose granularity is nearest to (and at most)
/// `frames_per_peak`, or `None` below the cached range.
fn level_for(frames_per_peak: f64) -> Option<usize> {
    if frames_per_peak < LEVEL_ZERO_RANGE as f64 {
        return None;
    }
    let mut level = 0usize;
    let mut range = LEVEL_ZERO_RANGE as f64 * 2.0;
    while level + 1 < CACHED_LEVELS && frames_per_peak >= range {
        level += 1;
        range *= 2.0;
    }
    Some(level)
}

struct ChannelReader {
    path: PathBuf,
    file: File,
    header: PeakHeader,
}

/// Read access to the peak data of one source.
///
/// Opening validates magic, version and that the peak data is not older
/// than the audio file. Micro-zoom requests and the ragged edges of
/// [`Peak::max_amplitude`] fall back to synchronous decoding of the
/// source itself; the pyramid is never consulted for normalization.
pub struct Peak {
    source_path: PathBuf,
    file_rate: u32,
    channels: Vec<ChannelReader>,
    /// Lazily opened decoder for micro view and norm boundary reads.
    reader: Option<FileReader>,
    scratch: DecodeBuffer,
}

impl Peak {
    /// Open peak files for every channel of a source.
    pub fn open(
        peakfiles_dir: &Path,
        source_path: &Path,
        channel_count: usize,
        file_rate: u32,
    ) -> Result<Self> {
        let source_mtime = std::fs::metadata(source_path)
            .and_then(|m| m.modified())
            .ok();

        let mut channels = Vec::with_capacity(channel_count);
        for chan in 0..channel_count {
            let path = peak_file_name(peakfiles_dir, source_path, chan);
            let mut file = File::open(&path).map_err(|e| {
                EngineError::Peak(PeakError::OpenFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

            if let (Some(source_mtime), Ok(peak_meta)) = (source_mtime, std::fs::metadata(&path)) {
                if let Ok(peak_mtime) = peak_meta.modified() {
                    if source_mtime > peak_mtime {
                        return Err(EngineError::Peak(PeakError::Stale {
                            path: path.display().to_string(),
                        }));
                    }
                }
            }

            let header = PeakHeader::read_from(&mut file, &path)?;
            channels.push(ChannelReader { path, file, header });
        }

        Ok(Peak {
            source_path: source_path.to_path_buf(),
            file_rate,
            channels,
            reader: None,
            scratch: DecodeBuffer::new(),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Peak pairs for rendering a waveform.
    ///
    /// `frames_per_peak` is the zoom granularity in 44.1 kHz-equivalent
    /// source frames per returned pair. At 64 and above the cached
    /// pyramid serves the request; below that the source file is decoded
    /// on the fly.
    pub fn calculate_peaks(
        &mut self,
        chan: usize,
        start: TimeRef,
        frames_per_peak: f64,
        count: usize,
    ) -> Result<Vec<PeakPair>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        match level_for(frames_per_peak) {
            Some(level) => self.read_pyramid(chan, start, level, count),
            None => self.compute_micro_view(chan, start, frames_per_peak, count),
        }
    }

    fn read_pyramid(
        &mut self,
        chan: usize,
        start: TimeRef,
        level: usize,
        count: usize,
    ) -> Result<Vec<PeakPair>> {
        let channel = &mut self.channels[chan];
        let header = &channel.header;

        let level_range = LEVEL_ZERO_RANGE << level;
        // Pyramid indices are spaced in time, so position by the
        // 44.1 kHz-equivalent frame count.
        let start_frame = start.to_frames(44_100);
        let first_pair = (start_frame / level_range).max(0);

        let level_size = header.sizes[level].max(0) as i64;
        if first_pair >= level_size {
            return Err(EngineError::Peak(PeakError::NoData));
        }
        let count = count.min((level_size - first_pair) as usize);

        let byte_pos =
            HEADER_BYTES + (header.offsets[level] as i64 + first_pair) as u64 * 4;
        channel.file.seek(SeekFrom::Start(byte_pos))?;

        let mut raw = vec![0u8; count * 4];
        let read = channel.file.read(&mut raw)?;
        let pairs_read = read / 4;
        if pairs_read == 0 {
            return Err(EngineError::Peak(PeakError::NoData));
        }

        Ok(raw[..pairs_read * 4]
            .chunks_exact(4)
            .map(|c| PeakPair {
                max: i16::from_le_bytes([c[0], c[1]]),
                neg_min: i16::from_le_bytes([c[2], c[3]]),
            })
            .collect())
    }

    fn compute_micro_view(
        &mut self,
        chan: usize,
        start: TimeRef,
        frames_per_peak: f64,
        count: usize,
    ) -> Result<Vec<PeakPair>> {
        let file_rate = self.file_rate;
        self.ensure_reader()?;
        let reader = self.reader.as_mut().unwrap();

        // Granularity is in 44.1 kHz-equivalent frames; convert to real
        // source frames for the read.
        let source_frames_per_peak = frames_per_peak * file_rate as f64 / 44_100.0;
        let start_frame = start.to_frames(file_rate);
        let to_read = (count as f64 * source_frames_per_peak).ceil() as usize;

        let read = reader.read_from(&mut self.scratch, start_frame, to_read)?;
        if read == 0 {
            return Err(EngineError::Peak(PeakError::NoData));
        }

        let samples = &self.scratch.channel(chan)[..read];
        let mut pairs = Vec::with_capacity(count);
        let mut bucket_end = source_frames_per_peak;
        let mut upper = f32::MIN;
        let mut lower = f32::MAX;
        for (i, sample) in samples.iter().enumerate() {
            upper = upper.max(*sample);
            lower = lower.min(*sample);
            if (i + 1) as f64 >= bucket_end || i + 1 == read {
                pairs.push(PeakPair {
                    max: (upper * MAX_PEAK_VALUE) as i16,
                    neg_min: (-lower * MAX_PEAK_VALUE) as i16,
                });
                upper = f32::MIN;
                lower = f32::MAX;
                bucket_end += source_frames_per_peak;
                if pairs.len() == count {
                    break;
                }
            }
        }
        Ok(pairs)
    }

    /// Absolute maximum of `[start, end)` across all channels.
    ///
    /// Whole 10000-frame windows come from the cached norm values; the
    /// two ragged boundaries are decoded synchronously. The pyramid is
    /// never used here, its quantization would bias the result.
    pub fn max_amplitude(&mut self, start: TimeRef, end: TimeRef) -> Result<f32> {
        let file_rate = self.file_rate;
        let start_frame = start.to_frames(file_rate);
        let end_frame = end.to_frames(file_rate);
        if end_frame <= start_frame {
            return Ok(0.0);
        }

        let channel_count = self.channels.len();
        let mut maxamp = 0.0f32;

        // Chunk indices fully covered by [start, end).
        let first_whole = (start_frame + NORMALIZE_CHUNK_SIZE - 1) / NORMALIZE_CHUNK_SIZE;
        let end_whole = end_frame / NORMALIZE_CHUNK_SIZE;

        // Left ragged edge.
        let left_end = (first_whole * NORMALIZE_CHUNK_SIZE).min(end_frame);
        if start_frame < left_end {
            maxamp = self.scan_file(start_frame, left_end, channel_count, maxamp)?;
        }

        // Right ragged edge.
        let right_start = (end_whole * NORMALIZE_CHUNK_SIZE).max(left_end);
        if right_start < end_frame {
            maxamp = self.scan_file(right_start, end_frame, channel_count, maxamp)?;
        }

        // Cached norm values for the whole windows in between.
        if end_whole > first_whole {
            let count = (end_whole - first_whole) as usize;
            let mut raw = vec![0u8; count * 4];
            for channel in &mut self.channels {
                let at = channel.header.norm_offset as u64 + first_whole as u64 * 4;
                channel.file.seek(SeekFrom::Start(at))?;
                let read = channel.file.read(&mut raw)?;
                for value in raw[..read - read % 4].chunks_exact(4) {
                    let norm = f32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                    maxamp = maxamp.max(norm);
                }
            }
        }

        Ok(maxamp)
    }

    fn scan_file(
        &mut self,
        start_frame: i64,
        end_frame: i64,
        channel_count: usize,
        mut maxamp: f32,
    ) -> Result<f32> {
        self.ensure_reader()?;
        let reader = self.reader.as_mut().unwrap();
        let read = reader.read_from(
            &mut self.scratch,
            start_frame,
            (end_frame - start_frame) as usize,
        )?;
        for chan in 0..channel_count {
            maxamp = mixer::compute_peak(&self.scratch.channel(chan)[..read], maxamp);
        }
        Ok(maxamp)
    }

    fn ensure_reader(&mut self) -> Result<()> {
        if self.reader.is_none() {
            self.reader = Some(FileReader::open(&self.source_path)?);
        }
        Ok(())
    }

    /// Paths of the peak files backing this store.
    pub fn file_paths(&self) -> Vec<&Path> {
        self.channels.iter().map(|c| c.path.as_path()).collect()
    }
}
