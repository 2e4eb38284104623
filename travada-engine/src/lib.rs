//! # Travada Engine
//!
//! Realtime multitrack audio engine with a lock-free disk-streaming
//! layer.
//!
//! **Architecture:** one realtime audio callback thread renders the
//! clip/track/bus mix graph; a dedicated disk I/O thread keeps per-source
//! slot rings filled (reads) and drained (captures); control code talks
//! to the realtime side exclusively through SPSC command/disposal queues.
//! Decoding goes through symphonia (with a hound fast path for WAV),
//! rate conversion through rubato, device binding through cpal.

pub mod audiofile;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod peak;
pub mod project;
pub mod runtime;

pub use error::{EngineError, Result};
