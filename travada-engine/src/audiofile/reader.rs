//! Audio file readers
//!
//! [`FileReader`] is a tagged variant over the concrete decoders:
//!
//! - [`WavFileReader`] — hound-based fast path for plain RIFF/WAVE PCM,
//!   with cheap exact seeking (this is what recorded takes use);
//! - [`W64FileReader`] — Wave64 PCM, the other capture container;
//! - [`SymphoniaReader`] — everything else (FLAC, MP3, Vorbis, ...),
//!   decoded through symphonia with accurate seek plus skip.
//!
//! All readers decode into a planar [`DecodeBuffer`] of f32 frames.
//! Integer PCM is normalized with power-of-two divisors (2^15, 2^23, 2^31)
//! so the write path's quantization round-trips exactly.
//!
//! Readers live on the disk I/O, peak-builder and export threads only;
//! nothing here is touched by the realtime thread.

use crate::audiofile::resampler::OutputDrivenResampler;
use crate::audiofile::w64;
use crate::error::{DecodeError, EngineError, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, warn};
use travada_common::TimeRef;

/// Planar decode scratch, grown on demand and reused across reads.
#[derive(Debug, Default)]
pub struct DecodeBuffer {
    channels: Vec<Vec<f32>>,
}

impl DecodeBuffer {
    pub fn new() -> Self {
        DecodeBuffer::default()
    }

    /// Make sure at least `channel_count` channels of `frames` frames are
    /// available.
    pub fn ensure_capacity(&mut self, channel_count: usize, frames: usize) {
        if self.channels.len() < channel_count {
            self.channels.resize_with(channel_count, Vec::new);
        }
        for chan in &mut self.channels[..channel_count] {
            if chan.len() < frames {
                chan.resize(frames, 0.0);
            }
        }
    }

    pub fn channel(&self, chan: usize) -> &[f32] {
        &self.channels[chan]
    }

    pub fn channel_mut(&mut self, chan: usize) -> &mut [f32] {
        &mut self.channels[chan]
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// RIFF/WAVE reader (hound).
pub struct WavFileReader {
    inner: hound::WavReader<BufReader<File>>,
    spec: hound::WavSpec,
    frames: i64,
    pos: i64,
}

impl WavFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let inner = hound::WavReader::open(path).map_err(|e| {
            EngineError::Decode(DecodeError::ProbeFailure {
                reason: format!("{}: {}", path.display(), e),
            })
        })?;
        let spec = inner.spec();
        if spec.channels == 0 {
            return Err(EngineError::Decode(DecodeError::ZeroChannels {
                path: path.display().to_string(),
            }));
        }
        let frames = inner.duration() as i64;
        Ok(WavFileReader {
            inner,
            spec,
            frames,
            pos: 0,
        })
    }

    fn seek(&mut self, frame: i64) -> Result<bool> {
        if frame >= self.frames {
            return Ok(false);
        }
        self.inner
            .seek(frame as u32)
            .map_err(|_| EngineError::Decode(DecodeError::SeekFailed { frame }))?;
        self.pos = frame;
        Ok(true)
    }

    fn read(&mut self, buf: &mut DecodeBuffer, count: usize) -> Result<usize> {
        let channels = self.spec.channels as usize;
        let count = count.min((self.frames - self.pos).max(0) as usize);
        if count == 0 {
            return Ok(0);
        }
        buf.ensure_capacity(channels, count);

        // One macro body per stored sample type; each reads `count` frames
        // of interleaved samples and writes planar f32.
        macro_rules! read_samples {
            ($ty:ty, $scale:expr) => {{
                let mut iter = self.inner.samples::<$ty>();
                let mut frames_read = 0usize;
                'frames: for frame in 0..count {
                    for chan in 0..channels {
                        match iter.next() {
                            Some(Ok(s)) => {
                                buf.channel_mut(chan)[frame] = s as f32 * $scale;
                            }
                            Some(Err(e)) => {
                                return Err(EngineError::Decode(DecodeError::CorruptedData {
                                    reason: e.to_string(),
                                }));
                            }
                            None => break 'frames,
                        }
                    }
                    frames_read = frame + 1;
                }
                frames_read
            }};
        }

        let frames_read = match self.spec.sample_format {
            hound::SampleFormat::Float => read_samples!(f32, 1.0f32),
            hound::SampleFormat::Int => {
                // hound yields raw integer sample values; normalize by
                // 2^(bits-1) so quantized material round-trips exactly.
                let scale = 1.0f32 / (1i64 << (self.spec.bits_per_sample - 1)) as f32;
                if self.spec.bits_per_sample <= 16 {
                    read_samples!(i16, scale)
                } else {
                    read_samples!(i32, scale)
                }
            }
        };

        self.pos += frames_read as i64;
        Ok(frames_read)
    }
}

/// Symphonia-based reader for compressed and exotic formats.
pub struct SymphoniaReader {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    rate: u32,
    frames: i64,
    /// Next frame index handed to the caller.
    pos: i64,
    /// Frames to drop before delivering (accurate seek lands on a packet
    /// boundary at or before the target).
    skip: u64,
    pending: Vec<Vec<f32>>,
    pending_offset: usize,
    eof: bool,
}

impl SymphoniaReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|_| {
            EngineError::Decode(DecodeError::FileNotFound {
                path: path.display().to_string(),
            })
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                EngineError::Decode(DecodeError::ProbeFailure {
                    reason: e.to_string(),
                })
            })?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(EngineError::Decode(DecodeError::NoAudioTracks))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let channels = codec_params
            .channels
            .map(|c| c.count())
            .ok_or(EngineError::Decode(DecodeError::ZeroChannels {
                path: path.display().to_string(),
            }))?;
        if channels == 0 {
            return Err(EngineError::Decode(DecodeError::ZeroChannels {
                path: path.display().to_string(),
            }));
        }
        let rate = codec_params.sample_rate.ok_or_else(|| {
            EngineError::Decode(DecodeError::ProbeFailure {
                reason: "sample rate not reported".to_string(),
            })
        })?;
        let frames = codec_params.n_frames.unwrap_or(0) as i64;
        if frames == 0 {
            warn!(
                "{}: container reports no frame count, length unknown",
                path.display()
            );
        }

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| {
                EngineError::Decode(DecodeError::UnsupportedFormat {
                    path: format!("{} ({})", path.display(), e),
                })
            })?;

        debug!(
            "Opened {} via symphonia: {} Hz, {} channels, {} frames",
            path.display(),
            rate,
            channels,
            frames
        );

        Ok(SymphoniaReader {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            channels,
            rate,
            frames,
            pos: 0,
            skip: 0,
            pending: vec![Vec::new(); channels],
            pending_offset: 0,
            eof: false,
        })
    }

    fn clear_pending(&mut self) {
        for chan in &mut self.pending {
            chan.clear();
        }
        self.pending_offset = 0;
    }

    fn seek(&mut self, frame: i64) -> Result<bool> {
        if self.frames > 0 && frame >= self.frames {
            return Ok(false);
        }
        self.clear_pending();
        self.eof = false;

        match self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame as u64,
                track_id: self.track_id,
            },
        ) {
            Ok(seeked) => {
                self.decoder.reset();
                self.skip = (frame as u64).saturating_sub(seeked.actual_ts);
                self.pos = frame;
                Ok(true)
            }
            Err(_) => {
                // Format cannot seek; rebuild the reader and decode-skip
                // from the start.
                let fresh = SymphoniaReader::open(&self.path)?;
                self.format = fresh.format;
                self.decoder = fresh.decoder;
                self.skip = frame as u64;
                self.pos = frame;
                Ok(true)
            }
        }
    }

    fn read(&mut self, buf: &mut DecodeBuffer, count: usize) -> Result<usize> {
        let count = if self.frames > 0 {
            count.min((self.frames - self.pos).max(0) as usize)
        } else {
            count
        };
        if count == 0 {
            return Ok(0);
        }
        buf.ensure_capacity(self.channels, count);

        let mut delivered = 0usize;
        while delivered < count {
            let available = self.pending[0].len() - self.pending_offset;
            if available > 0 {
                let take = available.min(count - delivered);
                for chan in 0..self.channels {
                    let src = &self.pending[chan]
                        [self.pending_offset..self.pending_offset + take];
                    buf.channel_mut(chan)[delivered..delivered + take].copy_from_slice(src);
                }
                self.pending_offset += take;
                delivered += take;
                continue;
            }

            if self.eof {
                break;
            }
            self.clear_pending();

            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    continue;
                }
                Err(e) => {
                    warn!("{}: packet read error: {}", self.path.display(), e);
                    self.eof = true;
                    continue;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let skip = std::mem::take(&mut self.skip);
                    let remaining = append_decoded(&mut self.pending, skip, &decoded);
                    self.skip = remaining;
                }
                Err(e) => {
                    warn!("{}: decode error: {}", self.path.display(), e);
                    continue;
                }
            }
        }

        self.pos += delivered as i64;
        Ok(delivered)
    }
}

/// Copy a decoded symphonia buffer into the planar pending store, dropping
/// `skip` leading frames. Returns the skip count still outstanding.
fn append_decoded(pending: &mut [Vec<f32>], skip: u64, decoded: &AudioBufferRef) -> u64 {
    fn append<S, F>(pending: &mut [Vec<f32>], skip: u64, buf: &AudioBuffer<S>, convert: F) -> u64
    where
        S: Sample,
        F: Fn(S) -> f32,
    {
        let frames = buf.frames() as u64;
        if skip >= frames {
            return skip - frames;
        }
        let start = skip as usize;
        let channels = buf.spec().channels.count();
        for chan in 0..channels.min(pending.len()) {
            let samples = buf.chan(chan);
            pending[chan].extend(samples[start..].iter().map(|s| convert(*s)));
        }
        0
    }

    match decoded {
        AudioBufferRef::F32(buf) => append(pending, skip, buf, |s| s),
        AudioBufferRef::F64(buf) => append(pending, skip, buf, |s| s as f32),
        AudioBufferRef::S32(buf) => append(pending, skip, buf, |s| s as f32 / 2_147_483_648.0),
        AudioBufferRef::S24(buf) => {
            append(pending, skip, buf, |s| s.inner() as f32 / 8_388_608.0)
        }
        AudioBufferRef::S16(buf) => append(pending, skip, buf, |s| s as f32 / 32_768.0),
        AudioBufferRef::S8(buf) => append(pending, skip, buf, |s| s as f32 / 128.0),
        AudioBufferRef::U32(buf) => {
            append(pending, skip, buf, |s| (s as i64 - 2_147_483_648) as f32 / 2_147_483_648.0)
        }
        AudioBufferRef::U24(buf) => append(pending, skip, buf, |s| {
            (s.inner() as i32 - 8_388_608) as f32 / 8_388_608.0
        }),
        AudioBufferRef::U16(buf) => {
            append(pending, skip, buf, |s| (s as i32 - 32_768) as f32 / 32_768.0)
        }
        AudioBufferRef::U8(buf) => {
            append(pending, skip, buf, |s| (s as i32 - 128) as f32 / 128.0)
        }
    }
}

/// Tagged variant over the concrete readers.
pub enum FileReader {
    Wav(WavFileReader),
    W64(w64::W64FileReader),
    Symphonia(SymphoniaReader),
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileReader::Wav(_) => f.debug_tuple("Wav").finish(),
            FileReader::W64(_) => f.debug_tuple("W64").finish(),
            FileReader::Symphonia(_) => f.debug_tuple("Symphonia").finish(),
        }
    }
}

impl FileReader {
    /// Open a file with the cheapest capable decoder.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EngineError::Decode(DecodeError::FileNotFound {
                path: path.display().to_string(),
            }));
        }
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("wav") => Ok(FileReader::Wav(WavFileReader::open(path)?)),
            Some("w64") => Ok(FileReader::W64(w64::W64FileReader::open(path)?)),
            _ => Ok(FileReader::Symphonia(SymphoniaReader::open(path)?)),
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            FileReader::Wav(r) => r.spec.channels as usize,
            FileReader::W64(r) => r.channel_count(),
            FileReader::Symphonia(r) => r.channels,
        }
    }

    pub fn file_rate(&self) -> u32 {
        match self {
            FileReader::Wav(r) => r.spec.sample_rate,
            FileReader::W64(r) => r.sample_rate(),
            FileReader::Symphonia(r) => r.rate,
        }
    }

    /// Total frames in the file, as reported by the container.
    pub fn frames(&self) -> i64 {
        match self {
            FileReader::Wav(r) => r.frames,
            FileReader::W64(r) => r.frames(),
            FileReader::Symphonia(r) => r.frames,
        }
    }

    /// File duration as a universal time reference.
    pub fn length(&self) -> TimeRef {
        TimeRef::from_frames(self.frames(), self.file_rate())
    }

    /// Next frame a plain `read` would deliver.
    pub fn pos(&self) -> i64 {
        match self {
            FileReader::Wav(r) => r.pos,
            FileReader::W64(r) => r.pos(),
            FileReader::Symphonia(r) => r.pos,
        }
    }

    /// Position the reader; `Ok(false)` when the frame is past EOF.
    pub fn seek(&mut self, frame: i64) -> Result<bool> {
        if self.pos() == frame {
            return Ok(true);
        }
        match self {
            FileReader::Wav(r) => r.seek(frame),
            FileReader::W64(r) => r.seek(frame),
            FileReader::Symphonia(r) => r.seek(frame),
        }
    }

    /// Decode up to `count` frames at the current position.
    pub fn read(&mut self, buf: &mut DecodeBuffer, count: usize) -> Result<usize> {
        match self {
            FileReader::Wav(r) => r.read(buf, count),
            FileReader::W64(r) => r.read(buf, count),
            FileReader::Symphonia(r) => r.read(buf, count),
        }
    }

    /// Seek-and-read convenience used by the peak builder and export path.
    pub fn read_from(&mut self, buf: &mut DecodeBuffer, start: i64, count: usize) -> Result<usize> {
        if !self.seek(start)? {
            return Ok(0);
        }
        self.read(buf, count)
    }
}

/// A [`FileReader`] with rate conversion to the engine output rate.
///
/// All frame positions on this API are in *output-rate* frames; the
/// conversion to file frames happens internally. This is the reader a
/// read source streams through, and what the export path decodes with.
pub struct ResampleReader {
    reader: FileReader,
    resampler: OutputDrivenResampler,
    output_rate: u32,
    chunk_frames: usize,
    out_length: i64,
    out_pos: i64,
    scratch: DecodeBuffer,
    pending: Vec<Vec<f32>>,
    pending_offset: usize,
    /// File frames consumed so far (for EOF padding decisions).
    file_exhausted: bool,
}

impl ResampleReader {
    pub fn open(path: &Path, output_rate: u32, chunk_frames: usize) -> Result<Self> {
        let reader = FileReader::open(path)?;
        let resampler = OutputDrivenResampler::new(
            reader.file_rate(),
            output_rate,
            reader.channel_count(),
            chunk_frames,
        )?;
        let out_length = resampler.output_length(reader.frames());
        let channels = reader.channel_count();
        Ok(ResampleReader {
            reader,
            resampler,
            output_rate,
            chunk_frames,
            out_length,
            out_pos: 0,
            scratch: DecodeBuffer::new(),
            pending: vec![Vec::new(); channels],
            pending_offset: 0,
            file_exhausted: false,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.reader.channel_count()
    }

    pub fn file_rate(&self) -> u32 {
        self.reader.file_rate()
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Length in output-rate frames.
    pub fn out_frames(&self) -> i64 {
        self.out_length
    }

    /// File duration as a universal time reference.
    pub fn length(&self) -> TimeRef {
        self.reader.length()
    }

    /// Reposition to an output-rate frame.
    pub fn seek_out_frame(&mut self, out_frame: i64) -> Result<bool> {
        if out_frame == self.out_pos {
            return Ok(true);
        }
        let file_frame =
            (out_frame as i128 * self.reader.file_rate() as i128 / self.output_rate as i128) as i64;
        let ok = self.reader.seek(file_frame)?;
        self.resampler.reset();
        for chan in &mut self.pending {
            chan.clear();
        }
        self.pending_offset = 0;
        self.file_exhausted = false;
        self.out_pos = out_frame;
        Ok(ok)
    }

    fn pending_available(&self) -> usize {
        self.pending.first().map(|c| c.len()).unwrap_or(0) - self.pending_offset
    }

    /// Read `count` output-rate frames at the current position.
    pub fn read(&mut self, buf: &mut DecodeBuffer, count: usize) -> Result<usize> {
        let channels = self.reader.channel_count();
        let remaining = (self.out_length - self.out_pos).max(0) as usize;
        let count = count.min(remaining);
        if count == 0 {
            return Ok(0);
        }
        buf.ensure_capacity(channels, count);

        if self.resampler.is_pass_through() {
            let read = self.reader.read(buf, count)?;
            self.out_pos += read as i64;
            return Ok(read);
        }

        let mut delivered = 0usize;
        while delivered < count {
            let available = self.pending_available();
            if available > 0 {
                let take = available.min(count - delivered);
                for chan in 0..channels {
                    let src =
                        &self.pending[chan][self.pending_offset..self.pending_offset + take];
                    buf.channel_mut(chan)[delivered..delivered + take].copy_from_slice(src);
                }
                self.pending_offset += take;
                delivered += take;
                continue;
            }

            if self.file_exhausted {
                break;
            }

            // Refill: feed the resampler exactly the frames it asks for,
            // zero-padding past EOF so the filter can drain.
            let need = self
                .resampler
                .input_frames_next()
                .unwrap_or(self.chunk_frames);
            self.scratch.ensure_capacity(channels, need);
            let read = self.reader.read(&mut self.scratch, need)?;
            if read < need {
                for chan in 0..channels {
                    self.scratch.channel_mut(chan)[read..need].fill(0.0);
                }
                if read == 0 {
                    self.file_exhausted = true;
                }
            }
            let input: Vec<&[f32]> = (0..channels)
                .map(|chan| &self.scratch.channel(chan)[..need])
                .collect();
            let output = self.resampler.process(&input)?;

            self.pending = output;
            self.pending_offset = 0;
        }

        self.out_pos += delivered as i64;
        Ok(delivered)
    }

    /// Seek-and-read in output-rate frames.
    pub fn read_at(&mut self, buf: &mut DecodeBuffer, out_frame: i64, count: usize) -> Result<usize> {
        if out_frame != self.out_pos && !self.seek_out_frame(out_frame)? {
            return Ok(0);
        }
        self.read(buf, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_test_wav(frames: usize, rate: u32, channels: u16) -> tempfile::TempPath {
        let file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(file.path(), spec).unwrap();
        for frame in 0..frames {
            for chan in 0..channels {
                // Channel-tagged ramp so positions are recognizable.
                let value = frame as f32 / frames as f32 + chan as f32 * 2.0;
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
        file.into_temp_path()
    }

    #[test]
    fn wav_reader_reports_format() {
        let path = write_test_wav(1000, 48_000, 2);
        let reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.channel_count(), 2);
        assert_eq!(reader.file_rate(), 48_000);
        assert_eq!(reader.frames(), 1000);
        assert_eq!(reader.length(), TimeRef::from_frames(1000, 48_000));
    }

    #[test]
    fn wav_reader_reads_planar_frames() {
        let path = write_test_wav(100, 44_100, 2);
        let mut reader = FileReader::open(&path).unwrap();
        let mut buf = DecodeBuffer::new();

        let read = reader.read(&mut buf, 10).unwrap();
        assert_eq!(read, 10);
        assert!((buf.channel(0)[5] - 0.05).abs() < 1e-6);
        assert!((buf.channel(1)[5] - 2.05).abs() < 1e-6);
    }

    #[test]
    fn wav_reader_seek_is_idempotent() {
        let path = write_test_wav(1000, 44_100, 1);
        let mut reader = FileReader::open(&path).unwrap();
        let mut buf = DecodeBuffer::new();

        let first = {
            reader.read_from(&mut buf, 500, 16).unwrap();
            buf.channel(0)[..16].to_vec()
        };
        // Read from elsewhere, then come back.
        reader.read_from(&mut buf, 10, 16).unwrap();
        reader.read_from(&mut buf, 500, 16).unwrap();
        assert_eq!(&buf.channel(0)[..16], first.as_slice());
    }

    #[test]
    fn read_past_eof_truncates() {
        let path = write_test_wav(100, 44_100, 1);
        let mut reader = FileReader::open(&path).unwrap();
        let mut buf = DecodeBuffer::new();

        let read = reader.read_from(&mut buf, 90, 64).unwrap();
        assert_eq!(read, 10);
        let read = reader.read_from(&mut buf, 200, 64).unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn open_missing_file_fails() {
        let err = FileReader::open(Path::new("/nonexistent/audio.wav")).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Decode(DecodeError::FileNotFound { .. })
        ));
    }

    #[test]
    fn open_garbage_fails_probe() {
        let mut file = tempfile::Builder::new().suffix(".xyz").tempfile().unwrap();
        file.write_all(b"this is not audio").unwrap();
        assert!(FileReader::open(file.path()).is_err());
    }

    #[test]
    fn resample_reader_pass_through_matches_file() {
        let path = write_test_wav(2000, 44_100, 1);
        let mut reader = ResampleReader::open(&path, 44_100, 512).unwrap();
        assert_eq!(reader.out_frames(), 2000);

        let mut buf = DecodeBuffer::new();
        let read = reader.read_at(&mut buf, 100, 50).unwrap();
        assert_eq!(read, 50);
        assert!((buf.channel(0)[0] - 100.0 / 2000.0).abs() < 1e-6);
    }

    #[test]
    fn resample_reader_produces_requested_counts() {
        let path = write_test_wav(48_000, 48_000, 2);
        let mut reader = ResampleReader::open(&path, 44_100, 512).unwrap();
        assert_eq!(reader.out_frames(), 44_100);

        let mut buf = DecodeBuffer::new();
        let mut total = 0usize;
        loop {
            let read = reader.read(&mut buf, 512).unwrap();
            if read == 0 {
                break;
            }
            total += read;
        }
        assert_eq!(total as i64, reader.out_frames());
    }
}
