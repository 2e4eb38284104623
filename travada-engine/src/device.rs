//! Audio device binding (cpal)
//!
//! Thin collaborator around the engine core: opens an output stream,
//! moves the sheet into the callback and interleaves the master bus into
//! the device buffer. The callback only ever calls
//! [`Sheet::process_cycle`] and copies samples; device buffers larger
//! than the engine block size are processed in block-sized sub-cycles.

use crate::error::{EngineError, Result};
use crate::project::sheet::Sheet;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info, warn};
use travada_common::config::DeviceConfig;

const OUTPUT_CHANNELS: usize = 2;

/// An open output stream owning the sheet it renders.
pub struct AudioDevice {
    stream: cpal::Stream,
    sample_rate: u32,
    block_size: usize,
}

impl AudioDevice {
    /// Open the default output device and start rendering `sheet`.
    ///
    /// The sheet moves into the realtime callback; all further contact
    /// goes through its [`SheetController`](crate::project::sheet::SheetController).
    pub fn open(config: &DeviceConfig, mut sheet: Sheet) -> Result<AudioDevice> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::Config("no audio output device available".into()))?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let block_size = config.block_size as usize;
        let stream_config = cpal::StreamConfig {
            channels: OUTPUT_CHANNELS as u16,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.block_size),
        };

        let data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            // The device may hand over more than one block worth of
            // frames; run whole cycles of at most block_size each.
            for chunk in data.chunks_mut(block_size * OUTPUT_CHANNELS) {
                let nframes = chunk.len() / OUTPUT_CHANNELS;
                sheet.process_cycle(nframes);
                let master = sheet.master();
                for frame in 0..nframes {
                    for chan in 0..OUTPUT_CHANNELS {
                        chunk[frame * OUTPUT_CHANNELS + chan] =
                            master.channel(chan, nframes)[frame];
                    }
                }
            }
        };
        let err_fn = |e: cpal::StreamError| {
            error!("Audio stream error: {}", e);
        };

        let stream = match device.build_output_stream(&stream_config, data_fn, err_fn, None) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Failed to open output stream on {} with fixed block {}: {}",
                    device_name, block_size, e
                );
                return Err(EngineError::Config(format!(
                    "failed to open output stream on {}: {}",
                    device_name, e
                )));
            }
        };

        stream
            .play()
            .map_err(|e| EngineError::Config(format!("failed to start stream: {}", e)))?;

        info!(
            "Audio device open: {} at {} Hz, block {}",
            device_name, config.sample_rate, config.block_size
        );

        Ok(AudioDevice {
            stream,
            sample_rate: config.sample_rate,
            block_size,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pause the stream; the sheet inside the callback is parked until
    /// the device is dropped.
    pub fn stop(&self) {
        let _ = self.stream.pause();
    }
}
