//! Error types for the engine
//!
//! The realtime thread never constructs or propagates these: it flips
//! atomic status flags that the control thread polls. Everything below is
//! for the disk, peak and control paths.
//!
//! Propagation rules:
//! - A fatal source error marks the source invalid; clips referencing it
//!   render silence and a single message is surfaced per source.
//! - Sync loss is not an error at all (the cycle renders silence and disk
//!   I/O re-syncs); it never appears here.
//! - A peak failure only degrades waveform display and normalization.
//! - An encode failure during capture stops that track's capture; other
//!   tracks continue.

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding-specific errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Encoding-specific errors
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Peak file errors
    #[error("Peak error: {0}")]
    Peak(#[from] PeakError),

    /// Configuration errors (no device, bad export spec, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<travada_common::Error> for EngineError {
    fn from(e: travada_common::Error) -> Self {
        match e {
            travada_common::Error::Io(io) => EngineError::Io(io),
            travada_common::Error::Config(msg) => EngineError::Config(msg),
            travada_common::Error::Other(other) => EngineError::Other(other),
        }
    }
}

/// Errors related to audio decoding
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Audio file does not exist
    #[error("Audio file not found: {path}")]
    FileNotFound { path: String },

    /// Unsupported audio format
    #[error("Unsupported audio format: {path}")]
    UnsupportedFormat { path: String },

    /// Failed to probe audio format
    #[error("Failed to probe audio format: {reason}")]
    ProbeFailure { reason: String },

    /// No audio tracks in file
    #[error("No audio tracks found in file")]
    NoAudioTracks,

    /// A file with zero channels cannot feed a clip
    #[error("Audio file has zero channels: {path}")]
    ZeroChannels { path: String },

    /// Seek failed
    #[error("Failed to seek to frame {frame}")]
    SeekFailed { frame: i64 },

    /// Decoder rejected the stream mid-file
    #[error("Corrupted audio data: {reason}")]
    CorruptedData { reason: String },

    /// Resampler construction or processing failed
    #[error("Resampling error: {reason}")]
    Resampling { reason: String },
}

/// Errors related to audio encoding (recording and export)
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Could not create the output file
    #[error("Failed to create {path}: {reason}")]
    CreateFailed { path: String, reason: String },

    /// A write failed mid-stream (disk full, device gone)
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Finalizing the file (header patch, flush) failed
    #[error("Failed to finalize output file: {reason}")]
    FinishFailed { reason: String },

    /// The export specification is inconsistent
    #[error("Invalid export specification: {reason}")]
    InvalidSpec { reason: String },
}

/// Errors related to peak files
#[derive(Debug, Error)]
pub enum PeakError {
    /// Peak file could not be opened or created
    #[error("Failed to open peak file {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// Magic/version mismatch; the file will be rebuilt
    #[error("Peak file {path} has an incompatible header")]
    IncompatibleHeader { path: String },

    /// The audio source is newer than the peak file; rebuild required
    #[error("Peak file {path} is older than its source")]
    Stale { path: String },

    /// Build was cancelled; the partial file has been removed
    #[error("Peak build interrupted")]
    Interrupted,

    /// No peak data for the requested range
    #[error("No peak data available")]
    NoData,
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, EngineError>;
