//! Configuration loading and management
//!
//! Bootstrap configuration comes from a TOML file; every field has a
//! default so a missing file yields a usable configuration. Command-line
//! overrides are applied by the binary after loading.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Recording/export container formats.
///
/// The compressed lossless option of the original design is not carried:
/// no maintained encoder exists in the ecosystem we build on, so captures
/// are written as plain RIFF or Wave64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// RIFF/WAVE (default)
    Wav,
    /// Sony Wave64, for captures that may exceed 4 GB
    W64,
}

impl Default for RecordFormat {
    fn default() -> Self {
        RecordFormat::Wav
    }
}

/// Sample formats for recording and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitDepth {
    /// 16-bit integer PCM (dithered on write)
    Int16,
    /// 24-bit integer PCM
    Int24,
    /// 32-bit float PCM
    Float32,
}

impl Default for BitDepth {
    fn default() -> Self {
        BitDepth::Float32
    }
}

impl BitDepth {
    /// Bits per sample as stored in the container header.
    pub fn bits(self) -> u16 {
        match self {
            BitDepth::Int16 => 16,
            BitDepth::Int24 => 24,
            BitDepth::Float32 => 32,
        }
    }
}

/// Audio device parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Frames per audio cycle (and per ring buffer slot)
    pub block_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            sample_rate: 44_100,
            block_size: 1024,
        }
    }
}

/// Engine internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Slots per read/write source ring (free + rt combined)
    pub slot_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { slot_count: 50 }
    }
}

/// Capture settings for armed tracks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Container written by capture write sources
    pub file_format: RecordFormat,

    /// Sample format written by capture write sources
    pub bit_depth: BitDepth,
}

/// Project directory layout.
///
/// A project directory contains an audio sources directory (one file per
/// imported or recorded source) and a peak files directory
/// (`<sourcename>-chN.peak`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub audiosources_dir: String,
    pub peakfiles_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            audiosources_dir: "audiosources".to_string(),
            peakfiles_dir: "peakfiles".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub engine: EngineConfig,
    pub recording: RecordingConfig,
    pub project: ProjectConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the default configuration; a present but
    /// unparsable file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Default config file location: `<user config dir>/travada/travada.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("travada")
            .join("travada.toml")
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.device.sample_rate == 0 {
            return Err(Error::Config("device.sample_rate must be non-zero".into()));
        }
        if !self.device.block_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "device.block_size must be a power of two, got {}",
                self.device.block_size
            )));
        }
        if self.engine.slot_count < 4 {
            return Err(Error::Config(format!(
                "engine.slot_count must be at least 4, got {}",
                self.engine.slot_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.sample_rate, 44_100);
        assert_eq!(config.engine.slot_count, 50);
        assert_eq!(config.recording.file_format, RecordFormat::Wav);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/travada.toml")).unwrap();
        assert_eq!(config.device.block_size, 1024);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[device]\nsample_rate = 48000\n\n[recording]\nfile_format = \"w64\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.device.sample_rate, 48_000);
        assert_eq!(config.device.block_size, 1024);
        assert_eq!(config.recording.file_format, RecordFormat::W64);
    }

    #[test]
    fn invalid_block_size_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[device]\nblock_size = 1000").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
