//! # Travada Common Library
//!
//! Shared code for the Travada workspace:
//! - Universal-rate time references (TimeRef)
//! - Configuration loading
//! - Event types (EngineEvent enum) and the broadcast event bus
//! - Gain/decibel conversions
//! - Object id generation

pub mod config;
pub mod error;
pub mod events;
pub mod gain;
pub mod ids;
pub mod timeref;

pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus, InfoLevel};
pub use timeref::{TimeRef, UNIVERSAL_RATE};
