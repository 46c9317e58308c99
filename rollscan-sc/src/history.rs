//! History ledger
//!
//! Newest-first, capped audit trail of scan outcomes. Every mutation is
//! persisted before the call returns so a reload shows the same list.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::scan::tracker::Accepted;
use crate::store::{load_json, save_json, StateStore, HISTORY_KEY};

/// Placeholder shown for absent display fields
pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub subject_id: String,
    pub display_name: String,
    pub subject_number: String,
    /// Absent when the scan never got a position
    pub scan_number: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl HistoryEntry {
    /// Entry for an admitted scan; `failure` is set when its send failed
    pub fn for_admission(
        accepted: &Accepted,
        timestamp: DateTime<Utc>,
        failure: Option<String>,
    ) -> Self {
        let record = &accepted.record;
        Self {
            id: Uuid::new_v4(),
            subject_id: record.subject_id.clone(),
            display_name: record
                .display_name
                .clone()
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            subject_number: record
                .subject_number
                .clone()
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            scan_number: Some(accepted.scan_number),
            timestamp,
            status: if failure.is_some() {
                OutcomeStatus::Error
            } else {
                OutcomeStatus::Success
            },
            message: failure,
            operator: None,
            batch_id: accepted.batch_id.clone(),
        }
    }

    /// Entry for a scan that was not admitted
    pub fn for_failure(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: NOT_AVAILABLE.to_string(),
            display_name: NOT_AVAILABLE.to_string(),
            subject_number: NOT_AVAILABLE.to_string(),
            scan_number: None,
            timestamp,
            status: OutcomeStatus::Error,
            message: Some(message.into()),
            operator: None,
            batch_id: None,
        }
    }

    pub fn with_operator(mut self, operator: Option<String>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_batch(mut self, batch_id: Option<String>) -> Self {
        if batch_id.is_some() {
            self.batch_id = batch_id;
        }
        self
    }
}

pub struct HistoryLedger {
    store: Arc<dyn StateStore>,
    entries: Vec<HistoryEntry>,
    cap: usize,
}

impl HistoryLedger {
    /// Load the persisted ledger
    ///
    /// A corrupt ledger is replaced with an empty one; the audit trail is
    /// best-effort and must not block scanning.
    pub fn load(store: Arc<dyn StateStore>, cap: usize) -> Self {
        let mut entries: Vec<HistoryEntry> = match load_json(store.as_ref(), HISTORY_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!("Discarding unreadable scan history: {}", e);
                Vec::new()
            }
        };
        entries.truncate(cap);

        Self {
            store,
            entries,
            cap,
        }
    }

    /// Prepend `entry`, truncate to the cap, persist
    ///
    /// On a persist failure the in-memory ledger is left unchanged.
    pub fn record(&mut self, entry: HistoryEntry) -> rollscan_common::Result<()> {
        let mut updated = Vec::with_capacity(self.cap);
        updated.push(entry);
        updated.extend(self.entries.iter().take(self.cap.saturating_sub(1)).cloned());

        save_json(self.store.as_ref(), HISTORY_KEY, &updated)?;
        self.entries = updated;
        Ok(())
    }

    /// Empty both the in-memory and the durable copy
    pub fn clear(&mut self) -> rollscan_common::Result<()> {
        self.store.remove(HISTORY_KEY)?;
        self.entries.clear();
        Ok(())
    }

    /// Newest first
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.first()
    }

    pub fn total_recorded(&self) -> usize {
        self.entries.len()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}
