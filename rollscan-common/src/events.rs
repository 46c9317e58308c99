//! Event types for the rollscan event system
//!
//! Provides the shared event definitions and EventBus the scan session uses
//! to tell the shell what happened, so the shell never has to poll state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Operator-visible status of the scanning view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for a code
    Ready,
    /// A roster fetch or delivery send is in flight
    Sending,
    /// The last scan was accepted and its send attempt was issued
    LastScanOk,
    /// The last scan failed (malformed, rejected, or transport failure)
    LastScanFailed(String),
    /// The code reader could not be acquired; persistent for the session
    CameraUnavailable(String),
}

impl SessionStatus {
    /// Whether this status blocks any further scanning
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionStatus::CameraUnavailable(_))
    }
}

/// Scan session events
///
/// Events are broadcast via EventBus and are serializable so a shell can
/// forward them as JSON lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScanEvent {
    /// A scan was admitted and its send was dispatched
    ScanAccepted {
        /// 1-based position in the roll call
        scan_number: u32,
        /// Subject recorded by this scan
        subject_id: String,
        /// Display name, if the payload or roster carried one
        display_name: Option<String>,
        /// Batch the subject belongs to (None for inline payloads)
        batch_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A well-formed scan was refused by the sequence tracker
    ScanRejected {
        reason: String,
        /// True when the batch is exhausted and only a reset helps
        terminal: bool,
        timestamp: DateTime<Utc>,
    },

    /// Decoded text was not a recognized payload
    ScanMalformed {
        raw: String,
        timestamp: DateTime<Utc>,
    },

    /// Roster fetch or delivery send failed at the transport level
    DeliveryFailed {
        /// Set when the scan was already admitted before the send failed
        scan_number: Option<u32>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Status indicator changed
    StatusChanged {
        status: SessionStatus,
        timestamp: DateTime<Utc>,
    },

    /// Operator cleared the history ledger
    HistoryCleared { timestamp: DateTime<Utc> },

    /// Operator reset the roll call (subject set, roster cache, history)
    SessionReset { timestamp: DateTime<Utc> },

    /// Operator logged in or out
    OperatorChanged {
        operator: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus
///
/// Wraps `tokio::sync::broadcast`: publishing never blocks, slow subscribers
/// see `Lagged`, and dropping a receiver unsubscribes it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ScanEvent) {
        let _ = self.tx.send(event);
    }
}
