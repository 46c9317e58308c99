//! Scan session
//!
//! Drives one scan at a time through parse → admit → dispatch, settles send
//! reports into the history as they come back, owns the operator identity
//! and the status indicator, and publishes a [`ScanEvent`] for everything
//! the shell should re-render.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rollscan_common::events::{EventBus, ScanEvent, SessionStatus};
use rollscan_common::time;
use tracing::{debug, error, info, trace, warn};

use crate::decoder::{CameraError, DecoderEvent, ScannerHandle};
use crate::delivery::{DeliveryQueue, DeliveryReport};
use crate::history::{HistoryEntry, HistoryLedger};
use crate::scan::{
    parse, Accepted, Admission, AdmitError, ParseError, Progress, Rejection, RosterSource,
    ScanPayload, SequenceTracker,
};
use crate::store::StateStore;
use crate::Result;

/// Longest raw text quoted in a history message
const MAX_QUOTED_RAW: usize = 80;

/// What happened to one decoded code
#[derive(Debug)]
pub enum ScanOutcome {
    /// Admitted and its send dispatched; the send result arrives later
    Admitted(Accepted),
    Rejected(Rejection),
    Malformed(ParseError),
    /// Roster lookup or state persistence failed; nothing was admitted
    AdmitFailed(AdmitError),
}

impl ScanOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, ScanOutcome::Admitted(_))
    }
}

pub struct ScanSession {
    tracker: SequenceTracker,
    roster: Arc<dyn RosterSource>,
    delivery: DeliveryQueue,
    ledger: HistoryLedger,
    operator: Option<String>,
    status: SessionStatus,
    events: EventBus,
}

impl ScanSession {
    pub fn new(
        tracker: SequenceTracker,
        ledger: HistoryLedger,
        roster: Arc<dyn RosterSource>,
        delivery: DeliveryQueue,
        events: EventBus,
    ) -> Self {
        Self {
            tracker,
            roster,
            delivery,
            ledger,
            operator: None,
            status: SessionStatus::Ready,
            events,
        }
    }

    /// Load tracker and ledger from `store` and build a session around them
    pub fn open(
        store: Arc<dyn StateStore>,
        history_cap: usize,
        roster: Arc<dyn RosterSource>,
        delivery: DeliveryQueue,
        events: EventBus,
    ) -> Result<Self> {
        let tracker = SequenceTracker::load(store.clone())?;
        let ledger = HistoryLedger::load(store, history_cap);
        Ok(Self::new(tracker, ledger, roster, delivery, events))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn operator(&self) -> Option<&str> {
        self.operator.as_deref()
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn progress(&self) -> Progress {
        self.tracker.progress()
    }

    /// Sends dispatched whose result has not been settled yet
    pub fn deliveries_in_flight(&self) -> usize {
        self.delivery.in_flight()
    }

    /// History entries, newest first
    pub fn history(&self) -> &[HistoryEntry] {
        self.ledger.entries()
    }

    /// Attach `name` to subsequent history entries; blank means logout
    pub fn login(&mut self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            self.logout();
            return;
        }
        info!(operator = name, "Operator logged in");
        self.operator = Some(name.to_string());
        self.events.emit_lossy(ScanEvent::OperatorChanged {
            operator: self.operator.clone(),
            timestamp: time::now(),
        });
    }

    pub fn logout(&mut self) {
        if let Some(previous) = self.operator.take() {
            info!(operator = %previous, "Operator logged out");
            self.events.emit_lossy(ScanEvent::OperatorChanged {
                operator: None,
                timestamp: time::now(),
            });
        }
    }

    /// Mark the scanning view dead; persists for the rest of the session
    pub fn camera_unavailable(&mut self, err: &CameraError) {
        error!("Scanning disabled: {}", err);
        self.set_status(SessionStatus::CameraUnavailable(err.to_string()));
    }

    /// Process one decoded code
    ///
    /// Returns once the scan is admitted and its send dispatched; the send
    /// itself is settled later by [`ScanSession::run`] or
    /// [`ScanSession::settle_deliveries`].
    pub async fn handle_scan(&mut self, raw: &str) -> ScanOutcome {
        let scanned_at = time::now();

        let payload = match parse(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(raw = %quote(raw), "Malformed code ignored");
                self.record(HistoryEntry::for_failure(
                    format!("Malformed code: {}", quote(raw)),
                    scanned_at,
                ));
                self.events.emit_lossy(ScanEvent::ScanMalformed {
                    raw: raw.to_string(),
                    timestamp: scanned_at,
                });
                self.set_status(SessionStatus::LastScanFailed("Malformed code".to_string()));
                return ScanOutcome::Malformed(e);
            }
        };

        let batch_hint = match &payload {
            ScanPayload::BatchRef { batch_id } => Some(batch_id.clone()),
            ScanPayload::Inline(_) => None,
        };

        // A batch admit may fetch the roster
        if batch_hint.is_some() {
            self.set_status(SessionStatus::Sending);
        }

        let admission = match self.tracker.admit(payload, self.roster.as_ref()).await {
            Ok(admission) => admission,
            Err(e) => return self.admit_failed(e, batch_hint, scanned_at),
        };

        match admission {
            Admission::Rejected(rejection) => self.rejected(rejection, batch_hint, scanned_at),
            Admission::Accepted(accepted) => self.dispatch(accepted, scanned_at),
        }
    }

    fn dispatch(&mut self, accepted: Accepted, scanned_at: DateTime<Utc>) -> ScanOutcome {
        self.delivery.dispatch(accepted.clone(), scanned_at);

        self.events.emit_lossy(ScanEvent::ScanAccepted {
            scan_number: accepted.scan_number,
            subject_id: accepted.record.subject_id.clone(),
            display_name: accepted.record.display_name.clone(),
            batch_id: accepted.batch_id.clone(),
            timestamp: scanned_at,
        });
        self.set_status(SessionStatus::Sending);
        ScanOutcome::Admitted(accepted)
    }

    /// Record the result of one send
    fn settle(&mut self, report: DeliveryReport) {
        let DeliveryReport {
            accepted,
            scanned_at,
            result,
        } = report;

        match result {
            Ok(_) => {
                self.record(HistoryEntry::for_admission(&accepted, scanned_at, None));
                self.set_status(SessionStatus::LastScanOk);
            }
            Err(error) => {
                let message = format!("Send failed: {}", error);
                self.record(HistoryEntry::for_admission(
                    &accepted,
                    scanned_at,
                    Some(message.clone()),
                ));
                self.events.emit_lossy(ScanEvent::DeliveryFailed {
                    scan_number: Some(accepted.scan_number),
                    error: error.to_string(),
                    timestamp: scanned_at,
                });
                self.set_status(SessionStatus::LastScanFailed(message));
            }
        }
    }

    /// Wait for every dispatched send and settle it; returns how many
    ///
    /// Never resolves while a send hangs, so callers bound it (shutdown
    /// signal, timeout).
    pub async fn settle_deliveries(&mut self) -> usize {
        let mut settled = 0;
        while let Some(report) = self.delivery.next_report().await {
            self.settle(report);
            settled += 1;
        }
        settled
    }

    fn rejected(
        &mut self,
        rejection: Rejection,
        batch_hint: Option<String>,
        scanned_at: DateTime<Utc>,
    ) -> ScanOutcome {
        let reason = rejection.to_string();
        if rejection.is_terminal() {
            warn!("{} (reset required)", reason);
        } else {
            warn!("{}", reason);
        }

        self.record(HistoryEntry::for_failure(reason.clone(), scanned_at).with_batch(batch_hint));
        self.events.emit_lossy(ScanEvent::ScanRejected {
            reason: reason.clone(),
            terminal: rejection.is_terminal(),
            timestamp: scanned_at,
        });
        self.set_status(SessionStatus::LastScanFailed(reason));
        ScanOutcome::Rejected(rejection)
    }

    fn admit_failed(
        &mut self,
        error: AdmitError,
        batch_hint: Option<String>,
        scanned_at: DateTime<Utc>,
    ) -> ScanOutcome {
        let message = error.to_string();
        match &error {
            AdmitError::Roster(transport) => {
                warn!("{}", message);
                self.events.emit_lossy(ScanEvent::DeliveryFailed {
                    scan_number: None,
                    error: transport.to_string(),
                    timestamp: scanned_at,
                });
            }
            AdmitError::Store(_) => error!("{}", message),
        }

        self.record(HistoryEntry::for_failure(message.clone(), scanned_at).with_batch(batch_hint));
        self.set_status(SessionStatus::LastScanFailed(message));
        ScanOutcome::AdmitFailed(error)
    }

    /// Consume detections until the reader closes
    ///
    /// Send reports are settled as they arrive, between scans. Returns the
    /// number of decoded codes processed; sends still in flight when the
    /// reader closes are left for [`ScanSession::settle_deliveries`]. Cancel
    /// by dropping the future; an admission is durable before its send starts.
    pub async fn run(&mut self, scanner: &mut ScannerHandle) -> usize {
        let mut processed = 0;
        self.set_status(SessionStatus::Ready);

        loop {
            let in_flight = self.delivery.in_flight() > 0;
            tokio::select! {
                event = scanner.next_event() => match event {
                    Some(DecoderEvent::Detected(raw)) => {
                        let outcome = self.handle_scan(&raw).await;
                        debug!(admitted = outcome.is_admitted(), "Scan processed");
                        processed += 1;
                    }
                    Some(DecoderEvent::NoDetection) => trace!("No code in frame"),
                    None => break,
                },
                Some(report) = self.delivery.next_report(), if in_flight => {
                    self.settle(report);
                }
            }
        }

        info!(processed, "Code reader finished");
        processed
    }

    /// Operator reset: history, subject set, roster cache and inline numbering
    ///
    /// History is cleared first, so a failure part way through leaves the
    /// roll call intact; running the reset again finishes it.
    pub fn reset(&mut self) -> Result<()> {
        self.ledger.clear()?;
        self.tracker.reset()?;
        self.tracker.reset_inline_count()?;

        self.events.emit_lossy(ScanEvent::SessionReset {
            timestamp: time::now(),
        });
        self.set_status(SessionStatus::Ready);
        Ok(())
    }

    /// Operator clear-history; the roll call itself is untouched
    pub fn clear_history(&mut self) -> Result<()> {
        self.ledger.clear()?;
        self.tracker.reset_inline_count()?;

        info!("Scan history cleared");
        self.events.emit_lossy(ScanEvent::HistoryCleared {
            timestamp: time::now(),
        });
        Ok(())
    }

    fn record(&mut self, entry: HistoryEntry) {
        let entry = entry.with_operator(self.operator.clone());
        if let Err(e) = self.ledger.record(entry) {
            error!("Could not persist history entry: {}", e);
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status.is_fatal() || self.status == status {
            return;
        }
        self.status = status.clone();
        self.events.emit_lossy(ScanEvent::StatusChanged {
            status,
            timestamp: time::now(),
        });
    }
}

fn quote(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_QUOTED_RAW {
        return trimmed.to_string();
    }
    let mut quoted: String = trimmed.chars().take(MAX_QUOTED_RAW).collect();
    quoted.push('…');
    quoted
}
