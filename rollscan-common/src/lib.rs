//! # Rollscan Common Library
//!
//! Shared code for the rollscan scanner client and its shell:
//! - Configuration loading (TOML bootstrap + data folder resolution)
//! - Atomic file writes for durable local state
//! - Event types (ScanEvent enum) and the EventBus
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod time;

pub use error::{Error, Result};
