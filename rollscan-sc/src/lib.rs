//! # Rollscan Scanner Client (rollscan-sc)
//!
//! Roll-call scanning core: decoded codes are parsed, admitted into an
//! ordered, deduplicated roll call that survives restarts, and forwarded
//! to a remote spreadsheet endpoint.
//!
//! **Architecture:** decoder adapter → payload parser → sequence tracker →
//! delivery queue → history ledger, orchestrated by [`session::ScanSession`].

pub mod config;
pub mod decoder;
pub mod delivery;
pub mod error;
pub mod history;
pub mod scan;
pub mod session;
pub mod store;

pub use error::{Error, Result};
