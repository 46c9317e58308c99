//! Scan sequencing core
//!
//! Decoded text flows parser → tracker; the tracker consults the roster
//! collaborator for batch-reference payloads.

pub mod parser;
pub mod roster;
pub mod tracker;

pub use parser::{parse, AttendanceRecord, ParseError, ScanPayload};
pub use roster::{BatchRoster, HttpRosterClient, RosterEntry, RosterSource};
pub use tracker::{Accepted, Admission, AdmitError, Progress, Rejection, SequenceTracker};
