//! Peak file construction
//!
//! [`OnlinePeakBuilder`] is fed one buffer at a time — by the capture
//! path while recording, or by [`build_peaks`] scanning an existing file
//! in the background. Level-0 pairs stream straight into the peak file
//! and norm values into a temporary sidecar; `finish` then folds level 0
//! into the 14 decimated levels, appends the norm values and writes the
//! header.

use super::{
    peak_file_name, PeakHeader, PeakPair, CACHED_LEVELS, HEADER_BYTES, LEVEL_ZERO_RANGE,
    MAX_PEAK_VALUE, NORMALIZE_CHUNK_SIZE, PEAK_MAGIC,
};
use crate::audiofile::reader::{DecodeBuffer, FileReader};
use crate::error::{EngineError, PeakError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use travada_common::TimeRef;

/// Frames per chunk for the background scan.
const BUILD_CHUNK_FRAMES: usize = 65_536;

/// Per-channel accumulation state.
struct ProcessData {
    /// Advances one source frame per sample.
    process_location: TimeRef,
    /// Emission point of the next level-0 pair.
    next_data_point: TimeRef,
    step: TimeRef,
    range: TimeRef,
    upper: f32,
    lower: f32,
    samples_in_bucket: u64,
    norm_value: f32,
    norm_frames: i64,
    pair_count: i64,
    norm_count: i64,
}

impl ProcessData {
    fn new(file_rate: u32) -> Self {
        ProcessData {
            process_location: TimeRef::ZERO,
            next_data_point: TimeRef::from_frames(LEVEL_ZERO_RANGE, 44_100),
            step: TimeRef::from_frames(1, file_rate),
            // One data point per 64 frames at 44.1 kHz; a time span, so
            // other file rates cover proportionally more or fewer frames.
            range: TimeRef::from_frames(LEVEL_ZERO_RANGE, 44_100),
            upper: f32::MIN,
            lower: f32::MAX,
            samples_in_bucket: 0,
            norm_value: 0.0,
            norm_frames: 0,
            pair_count: 0,
            norm_count: 0,
        }
    }
}

struct ChannelBuild {
    path: PathBuf,
    norm_path: PathBuf,
    peaks: BufWriter<File>,
    norm: BufWriter<File>,
    pd: ProcessData,
}

/// Streaming peak writer for one source (all channels).
pub struct OnlinePeakBuilder {
    channels: Vec<ChannelBuild>,
    finished: bool,
}

impl OnlinePeakBuilder {
    /// Create (truncate) the peak files for a source and position them
    /// past the header, which is written last.
    pub fn create(
        peakfiles_dir: &Path,
        source_path: &Path,
        channel_count: usize,
        file_rate: u32,
    ) -> Result<Self> {
        std::fs::create_dir_all(peakfiles_dir)?;

        let mut channels = Vec::with_capacity(channel_count);
        for chan in 0..channel_count {
            let path = peak_file_name(peakfiles_dir, source_path, chan);
            let norm_path = path.with_extension("peak.norm");

            let open_failed = |p: &Path, e: std::io::Error| {
                EngineError::Peak(PeakError::OpenFailed {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })
            };

            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| open_failed(&path, e))?;
            file.seek(SeekFrom::Start(HEADER_BYTES))?;

            let norm_file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&norm_path)
                .map_err(|e| open_failed(&norm_path, e))?;

            channels.push(ChannelBuild {
                path,
                norm_path,
                peaks: BufWriter::new(file),
                norm: BufWriter::new(norm_file),
                pd: ProcessData::new(file_rate),
            });
        }

        Ok(OnlinePeakBuilder {
            channels,
            finished: false,
        })
    }

    /// Accumulate one buffer of samples for a channel.
    pub fn process(&mut self, chan: usize, samples: &[f32]) -> Result<()> {
        let channel = &mut self.channels[chan];
        let pd = &mut channel.pd;

        for &sample in samples {
            pd.process_location += pd.step;
            pd.norm_value = pd.norm_value.max(sample.abs());
            pd.upper = pd.upper.max(sample);
            pd.lower = pd.lower.min(sample);
            pd.samples_in_bucket += 1;

            if pd.process_location >= pd.next_data_point {
                let pair = PeakPair {
                    max: (pd.upper * MAX_PEAK_VALUE) as i16,
                    neg_min: (-pd.lower * MAX_PEAK_VALUE) as i16,
                };
                channel.peaks.write_all(&pair.max.to_le_bytes())?;
                channel.peaks.write_all(&pair.neg_min.to_le_bytes())?;
                pd.pair_count += 1;

                pd.upper = f32::MIN;
                pd.lower = f32::MAX;
                pd.samples_in_bucket = 0;
                pd.next_data_point += pd.range;
            }

            pd.norm_frames += 1;
            if pd.norm_frames == NORMALIZE_CHUNK_SIZE {
                channel.norm.write_all(&pd.norm_value.to_le_bytes())?;
                pd.norm_value = 0.0;
                pd.norm_frames = 0;
                pd.norm_count += 1;
            }
        }
        Ok(())
    }

    /// Emit trailing partial data points, build the pyramid and write
    /// headers. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        for channel in &mut self.channels {
            // Trailing partial bucket.
            if channel.pd.samples_in_bucket > 0 {
                let pair = PeakPair {
                    max: (channel.pd.upper * MAX_PEAK_VALUE) as i16,
                    neg_min: (-channel.pd.lower * MAX_PEAK_VALUE) as i16,
                };
                channel.peaks.write_all(&pair.max.to_le_bytes())?;
                channel.peaks.write_all(&pair.neg_min.to_le_bytes())?;
                channel.pd.pair_count += 1;
            }
            // Trailing partial norm window.
            if channel.pd.norm_frames > 0 {
                channel
                    .norm
                    .write_all(&channel.pd.norm_value.to_le_bytes())?;
                channel.pd.norm_count += 1;
            }

            channel.peaks.flush()?;
            channel.norm.flush()?;
            let mut file = channel.peaks.get_ref().try_clone()?;
            let mut norm_file = channel.norm.get_ref().try_clone()?;

            Self::finalize_channel(
                &mut file,
                &mut norm_file,
                channel.pd.pair_count,
                channel.pd.norm_count,
            )?;

            // The norm sidecar has been folded into the peak file.
            let _ = std::fs::remove_file(&channel.norm_path);
            debug!(
                "Peak file written: {} ({} level-0 pairs)",
                channel.path.display(),
                channel.pd.pair_count
            );
        }
        Ok(())
    }

    fn finalize_channel(
        file: &mut File,
        norm_file: &mut File,
        pair_count: i64,
        norm_count: i64,
    ) -> Result<()> {
        let mut header = PeakHeader {
            header_size: HEADER_BYTES as i32,
            ..Default::default()
        };

        header.sizes[0] = pair_count as i32;
        header.offsets[0] = 0;
        for level in 1..CACHED_LEVELS {
            header.sizes[level] = header.sizes[level - 1] / 2;
            header.offsets[level] = header.offsets[level - 1] + header.sizes[level - 1];
        }
        let total_pairs: i64 = header.sizes.iter().map(|s| *s as i64).sum();

        // Read level 0 back and decimate level by level.
        file.seek(SeekFrom::Start(HEADER_BYTES))?;
        let mut raw = vec![0u8; (pair_count * 4) as usize];
        file.read_exact(&mut raw)?;

        let mut pairs: Vec<PeakPair> = raw
            .chunks_exact(4)
            .map(|c| PeakPair {
                max: i16::from_le_bytes([c[0], c[1]]),
                neg_min: i16::from_le_bytes([c[2], c[3]]),
            })
            .collect();
        pairs.reserve((total_pairs - pair_count).max(0) as usize);

        for level in 1..CACHED_LEVELS {
            let prev_start = header.offsets[level - 1] as usize;
            let prev_size = header.sizes[level - 1] as usize;
            for i in 0..header.sizes[level] as usize {
                let a = pairs[prev_start + 2 * i];
                let b = pairs[prev_start + 2 * i + 1];
                pairs.push(a.merge(b));
            }
            debug_assert_eq!(
                header.sizes[level] as usize,
                prev_size / 2,
                "pyramid level size"
            );
        }

        // Rewrite the whole pyramid.
        file.seek(SeekFrom::Start(HEADER_BYTES))?;
        let mut out = Vec::with_capacity(pairs.len() * 4);
        for pair in &pairs {
            out.extend_from_slice(&pair.max.to_le_bytes());
            out.extend_from_slice(&pair.neg_min.to_le_bytes());
        }
        file.write_all(&out)?;

        // Norm values follow the pyramid.
        header.norm_offset = (HEADER_BYTES + total_pairs as u64 * 4) as i32;
        norm_file.seek(SeekFrom::Start(0))?;
        let mut norm_raw = vec![0u8; (norm_count * 4) as usize];
        norm_file.read_exact(&mut norm_raw)?;
        file.write_all(&norm_raw)?;

        header.write_to(file)?;
        file.flush()?;
        Ok(())
    }

    /// Remove all files of an aborted build.
    pub fn discard(self) {
        for channel in &self.channels {
            let _ = std::fs::remove_file(&channel.path);
            let _ = std::fs::remove_file(&channel.norm_path);
        }
    }
}

/// Scan a whole source file and build its peak files.
///
/// `interrupt` is checked once per 64k-frame chunk; an interrupted build
/// removes its partial output and reports [`PeakError::Interrupted`].
/// `progress` receives percentages in 0..=100.
pub fn build_peaks(
    source_path: &Path,
    peakfiles_dir: &Path,
    interrupt: &AtomicBool,
    mut progress: impl FnMut(u8),
) -> Result<()> {
    let mut reader = FileReader::open(source_path)?;
    let channel_count = reader.channel_count();
    let total_frames = reader.frames();
    if total_frames == 0 {
        warn!(
            "{}: source reports zero length, no peaks built",
            source_path.display()
        );
        return Err(EngineError::Peak(PeakError::NoData));
    }

    let mut builder = OnlinePeakBuilder::create(
        peakfiles_dir,
        source_path,
        channel_count,
        reader.file_rate(),
    )?;
    let mut buffer = DecodeBuffer::new();
    let mut total_read: i64 = 0;
    let mut last_percent = 0u8;

    loop {
        if interrupt.load(Ordering::Relaxed) {
            builder.discard();
            return Err(EngineError::Peak(PeakError::Interrupted));
        }

        let read = reader.read(&mut buffer, BUILD_CHUNK_FRAMES)?;
        if read == 0 {
            break;
        }
        for chan in 0..channel_count {
            builder.process(chan, &buffer.channel(chan)[..read])?;
        }

        total_read += read as i64;
        let percent = ((total_read * 100) / total_frames).min(100) as u8;
        if percent > last_percent {
            progress(percent);
            last_percent = percent;
        }
    }

    builder.finish()?;
    progress(100);
    Ok(())
}

/// `true` when a usable peak file set exists for the source (right magic
/// and not older than the audio file).
pub fn peaks_are_current(peakfiles_dir: &Path, source_path: &Path, channel_count: usize) -> bool {
    let source_mtime = match std::fs::metadata(source_path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(_) => return false,
    };
    for chan in 0..channel_count {
        let path = peak_file_name(peakfiles_dir, source_path, chan);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        match meta.modified() {
            Ok(peak_mtime) if peak_mtime >= source_mtime => {}
            _ => return false,
        }
        let mut magic = [0u8; 6];
        match File::open(&path).and_then(|mut f| f.read_exact(&mut magic).map(|_| ())) {
            Ok(()) if &magic == PEAK_MAGIC => {}
            _ => return false,
        }
    }
    true
}
