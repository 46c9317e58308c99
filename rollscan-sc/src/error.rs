//! Error types for rollscan-sc
//!
//! Component-level failures (`ParseError`, `Rejection`, `TransportError`,
//! `CameraError`) live next to the component that raises them; this enum is
//! what crosses the library boundary into the shell.

use thiserror::Error;

use crate::decoder::CameraError;
use crate::delivery::TransportError;
use crate::scan::tracker::AdmitError;

/// Main error type for the scanner client
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable state could not be read or written
    #[error("Storage error: {0}")]
    Storage(#[from] rollscan_common::Error),

    /// Code reader acquisition failed; fatal for the scanning view
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    /// Roster fetch or delivery send failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Admission could not complete
    #[error("Admit error: {0}")]
    Admit(#[from] AdmitError),

    /// File I/O errors outside the state store
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using rollscan-sc Error
pub type Result<T> = std::result::Result<T, Error>;
