//! Sequence tracker
//!
//! Owns the roll-call state: which subjects of the active batch have been
//! recorded, in order, and how many inline scans were accepted.
//!
//! The one rule everything else relies on: **state is persisted before
//! `admit` returns `Accepted`**. Delivery happens afterwards, so a failed
//! send, a crash, or a reload can never hand the same subject out twice. The
//! converse also holds: a subject whose send failed stays counted. Nothing
//! undoes an admission; only [`SequenceTracker::reset`] rewinds the count.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delivery::TransportError;
use crate::scan::parser::{AttendanceRecord, ScanPayload};
use crate::scan::roster::{BatchRoster, RosterSource};
use crate::store::{
    load_json, save_json, StateStore, ACTIVE_BATCH_KEY, INLINE_COUNT_KEY, SCANNED_SUBJECTS_KEY,
};

/// A scan admitted into the roll call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub record: AttendanceRecord,
    /// 1-based position in the roll call
    pub scan_number: u32,
    /// Batch the subject came from; None for inline payloads
    pub batch_id: Option<String>,
}

/// Why a well-formed scan was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Every subject of the batch is recorded; reset to start over
    #[error("All {roster_len} subjects of batch {batch_id} are already recorded")]
    BatchExhausted { batch_id: String, roster_len: usize },

    /// The remote roster for this batch is empty
    #[error("Batch {batch_id} not found or has no subjects")]
    UnknownBatch { batch_id: String },

    /// A different batch is in progress; reset to switch
    #[error("Batch {active} is in progress, cannot start {scanned} without a reset")]
    BatchMismatch { active: String, scanned: String },
}

impl Rejection {
    /// Whether only an operator reset can clear this condition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Rejection::BatchExhausted { .. } | Rejection::BatchMismatch { .. }
        )
    }
}

/// Result of a completed admit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(Accepted),
    Rejected(Rejection),
}

/// Admit could not run to completion; state is unchanged
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("Roster unavailable: {0}")]
    Roster(#[from] TransportError),

    #[error("Could not persist scan state: {0}")]
    Store(#[from] rollscan_common::Error),
}

/// Roll-call progress for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub batch_id: Option<String>,
    pub admitted: usize,
    /// Known once a roster is cached this session
    pub roster_len: Option<usize>,
    pub remaining: Option<usize>,
    pub percent: Option<u8>,
}

pub struct SequenceTracker {
    store: Arc<dyn StateStore>,
    subjects: Vec<String>,
    active_batch: Option<String>,
    inline_count: u32,
    /// Session-only; never persisted
    roster_cache: Option<BatchRoster>,
}

impl SequenceTracker {
    /// Rebuild the tracker from durable state
    ///
    /// Corrupt state is an error: treating it as empty would re-admit
    /// subjects that were already recorded.
    pub fn load(store: Arc<dyn StateStore>) -> rollscan_common::Result<Self> {
        let subjects: Vec<String> =
            load_json(store.as_ref(), SCANNED_SUBJECTS_KEY)?.unwrap_or_default();
        let active_batch: Option<String> = load_json(store.as_ref(), ACTIVE_BATCH_KEY)?;
        let inline_count: u32 = load_json(store.as_ref(), INLINE_COUNT_KEY)?.unwrap_or(0);

        debug!(
            admitted = subjects.len(),
            active_batch = ?active_batch,
            inline_count,
            "Sequence tracker loaded"
        );

        Ok(Self {
            store,
            subjects,
            active_batch,
            inline_count,
            roster_cache: None,
        })
    }

    /// Number of subjects recorded for the active batch
    pub fn admitted(&self) -> usize {
        self.subjects.len()
    }

    /// Recorded subject ids in admission order
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn active_batch(&self) -> Option<&str> {
        self.active_batch.as_deref()
    }

    pub fn inline_count(&self) -> u32 {
        self.inline_count
    }

    pub fn cached_roster(&self) -> Option<&BatchRoster> {
        self.roster_cache.as_ref()
    }

    /// Admit a parsed payload
    ///
    /// Returns only after any state change is durable.
    pub async fn admit(
        &mut self,
        payload: ScanPayload,
        roster: &dyn RosterSource,
    ) -> Result<Admission, AdmitError> {
        match payload {
            ScanPayload::Inline(record) => self.admit_inline(record),
            ScanPayload::BatchRef { batch_id } => self.admit_batch(batch_id, roster).await,
        }
    }

    fn admit_inline(&mut self, record: AttendanceRecord) -> Result<Admission, AdmitError> {
        let next = self.inline_count + 1;
        save_json(self.store.as_ref(), INLINE_COUNT_KEY, &next)?;
        self.inline_count = next;

        Ok(Admission::Accepted(Accepted {
            record,
            scan_number: next,
            batch_id: None,
        }))
    }

    async fn admit_batch(
        &mut self,
        batch_id: String,
        source: &dyn RosterSource,
    ) -> Result<Admission, AdmitError> {
        if !self.subjects.is_empty() {
            if let Some(active) = &self.active_batch {
                if *active != batch_id {
                    return Ok(Admission::Rejected(Rejection::BatchMismatch {
                        active: active.clone(),
                        scanned: batch_id,
                    }));
                }
            }
        }

        let needs_fetch = self
            .roster_cache
            .as_ref()
            .map_or(true, |cached| cached.batch_id != batch_id);
        if needs_fetch {
            let fetched = source.fetch(&batch_id).await?;
            if fetched.is_empty() {
                // Not cached: the remote may be populated later
                return Ok(Admission::Rejected(Rejection::UnknownBatch { batch_id }));
            }
            self.roster_cache = Some(fetched);
        }

        let Some(roster) = self.roster_cache.as_ref() else {
            return Ok(Admission::Rejected(Rejection::UnknownBatch { batch_id }));
        };

        let n = self.subjects.len();
        let exhausted = || {
            Admission::Rejected(Rejection::BatchExhausted {
                batch_id: batch_id.clone(),
                roster_len: roster.len(),
            })
        };
        if n >= roster.len() {
            return Ok(exhausted());
        }

        // Skip rows missing an identifier or repeating a recorded subject
        let Some((offset, entry)) = roster.entries[n..]
            .iter()
            .enumerate()
            .find(|(_, e)| e.is_complete() && !self.subjects.contains(&e.subject_id))
        else {
            warn!(batch_id = %batch_id, position = n, "No admissible roster rows left");
            return Ok(exhausted());
        };
        if offset > 0 {
            warn!(
                batch_id = %batch_id,
                position = n,
                skipped = offset,
                "Roster rows incomplete or already recorded, skipping"
            );
        }

        let record = entry.to_record();
        let mut subjects = self.subjects.clone();
        subjects.push(record.subject_id.clone());

        if self.active_batch.as_deref() != Some(batch_id.as_str()) {
            save_json(self.store.as_ref(), ACTIVE_BATCH_KEY, &batch_id)?;
            self.active_batch = Some(batch_id.clone());
        }
        save_json(self.store.as_ref(), SCANNED_SUBJECTS_KEY, &subjects)?;
        self.subjects = subjects;

        let scan_number = (n + 1) as u32;
        info!(
            batch_id = %batch_id,
            scan_number,
            subject_id = %record.subject_id,
            "Subject admitted"
        );

        Ok(Admission::Accepted(Accepted {
            record,
            scan_number,
            batch_id: Some(batch_id),
        }))
    }

    /// Clear the subject set and the roster cache
    ///
    /// The subject list is removed first; if that fails nothing changes.
    pub fn reset(&mut self) -> rollscan_common::Result<()> {
        self.store.remove(SCANNED_SUBJECTS_KEY)?;
        self.subjects.clear();
        self.roster_cache = None;

        // Only consulted while subjects exist, so a stale value is harmless
        if let Err(e) = self.store.remove(ACTIVE_BATCH_KEY) {
            warn!("Could not remove active batch marker: {}", e);
        }
        self.active_batch = None;

        info!("Roll call reset");
        Ok(())
    }

    /// Restart inline numbering (history was cleared)
    pub fn reset_inline_count(&mut self) -> rollscan_common::Result<()> {
        self.store.remove(INLINE_COUNT_KEY)?;
        self.inline_count = 0;
        Ok(())
    }

    pub fn progress(&self) -> Progress {
        let admitted = self.subjects.len();
        let roster_len = self
            .roster_cache
            .as_ref()
            .filter(|r| Some(r.batch_id.as_str()) == self.active_batch.as_deref())
            .map(BatchRoster::len);

        Progress {
            batch_id: self.active_batch.clone(),
            admitted,
            roster_len,
            remaining: roster_len.map(|len| len.saturating_sub(admitted)),
            percent: roster_len
                .filter(|len| *len > 0)
                .map(|len| ((admitted.min(len) * 100) / len) as u8),
        }
    }
}
