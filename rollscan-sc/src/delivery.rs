//! Delivery queue
//!
//! Fire-and-forget dispatch of admitted scans to the remote spreadsheet
//! endpoint. The endpoint is driven in opaque mode: its status and body are
//! never interpreted, so the only observable failure is a transport-level
//! error (no network, DNS failure, connection reset).
//!
//! [`SendIssued`] therefore means "the request went out", **not** "the
//! remote stored the row". There is no retry; a failed send is reported to
//! the caller once, later, and the admission it belongs to stands.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollscan_common::config::DeliveryConfig;
use rollscan_common::time::to_iso8601;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::scan::tracker::Accepted;

const USER_AGENT: &str = concat!("rollscan/", env!("CARGO_PKG_VERSION"));

/// Transport-level failures talking to the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    /// Only produced by calls whose response is read (roster fetch)
    #[error("Remote returned HTTP {0}")]
    Status(u16),

    #[error("Could not decode response: {0}")]
    Decode(String),

    #[error("Could not encode record: {0}")]
    Encode(String),
}

/// Proof that a send attempt was issued, not that it was stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendIssued {
    /// Size of the form body handed to the transport
    pub body_bytes: usize,
}

/// Build the shared HTTP client
///
/// No client-wide timeout: sends are never timed out, a hung request is
/// abandoned with the process.
pub fn build_http_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| TransportError::Network(e.to_string()))
}

/// Remote sink accepting one form-encoded record per call
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, form: &[(String, String)]) -> Result<SendIssued, TransportError>;
}

/// Form POST to the spreadsheet endpoint
pub struct HttpSink {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(http_client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, form: &[(String, String)]) -> Result<SendIssued, TransportError> {
        let body = form_len(form);
        let response = self
            .http_client
            .post(&self.endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        // Opaque mode: the status is informational only
        debug!(status = response.status().as_u16(), "Send attempt issued");
        Ok(SendIssued { body_bytes: body })
    }
}

/// Approximate encoded body length, for logging
fn form_len(form: &[(String, String)]) -> usize {
    form.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
}

/// JSON record posted to the spreadsheet
///
/// Field names are the spreadsheet's column keys.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub scan_number: u32,
    pub nim_user: String,
    pub nama_user: String,
    pub user_id: String,
    pub device_id: String,
    pub course_id: String,
    pub session_id: String,
    pub scanned_at: String,
}

impl ScanRecord {
    pub fn from_accepted(accepted: &Accepted, scanned_at: &DateTime<Utc>) -> Self {
        let record = &accepted.record;
        Self {
            batch_id: accepted.batch_id.clone(),
            scan_number: accepted.scan_number,
            nim_user: record.subject_number.clone().unwrap_or_default(),
            nama_user: record.display_name.clone().unwrap_or_default(),
            user_id: record.subject_id.clone(),
            device_id: record.device_id.clone(),
            course_id: record.course_id.clone(),
            session_id: record.session_id.clone(),
            scanned_at: to_iso8601(scanned_at),
        }
    }
}

/// Result of one send attempt, handed back to the session
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub accepted: Accepted,
    pub scanned_at: DateTime<Utc>,
    pub result: Result<SendIssued, TransportError>,
}

/// Issues exactly one send per admitted scan
///
/// Each send runs on its own task so a slow or hung endpoint never holds up
/// the next scan. Outcomes come back through [`DeliveryQueue::next_report`].
pub struct DeliveryQueue {
    sink: Arc<dyn Sink>,
    fields: DeliveryConfig,
    reports_tx: mpsc::UnboundedSender<DeliveryReport>,
    reports: mpsc::UnboundedReceiver<DeliveryReport>,
    in_flight: usize,
}

impl DeliveryQueue {
    pub fn new(sink: Arc<dyn Sink>, fields: DeliveryConfig) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        Self {
            sink,
            fields,
            reports_tx,
            reports,
            in_flight: 0,
        }
    }

    /// Transport form for an admitted scan
    ///
    /// Batch admissions carry `action` + the payload field; inline
    /// admissions carry only the inline payload field.
    pub fn form_for(&self, record: &ScanRecord) -> Result<Vec<(String, String)>, TransportError> {
        let json =
            serde_json::to_string(record).map_err(|e| TransportError::Encode(e.to_string()))?;

        Ok(if record.batch_id.is_some() {
            vec![
                ("action".to_string(), self.fields.action.clone()),
                (self.fields.payload_field.clone(), json),
            ]
        } else {
            vec![(self.fields.inline_payload_field.clone(), json)]
        })
    }

    /// Start the single send attempt for `accepted` and return at once
    ///
    /// A successful report is not proof of remote durability; see module docs.
    pub fn dispatch(&mut self, accepted: Accepted, scanned_at: DateTime<Utc>) {
        self.in_flight += 1;
        let record = ScanRecord::from_accepted(&accepted, &scanned_at);

        let form = match self.form_for(&record) {
            Ok(form) => form,
            Err(e) => {
                warn!(scan_number = record.scan_number, error = %e, "Scan not sent");
                let _ = self.reports_tx.send(DeliveryReport {
                    accepted,
                    scanned_at,
                    result: Err(e),
                });
                return;
            }
        };

        let sink = self.sink.clone();
        let reports_tx = self.reports_tx.clone();
        tokio::spawn(async move {
            let result = sink.send(&form).await;
            match &result {
                Ok(issued) => info!(
                    scan_number = record.scan_number,
                    subject_id = %record.user_id,
                    body_bytes = issued.body_bytes,
                    "Scan sent"
                ),
                Err(e) => warn!(
                    scan_number = record.scan_number,
                    subject_id = %record.user_id,
                    error = %e,
                    "Scan send failed, not retrying"
                ),
            }
            // Receiver gone means the queue was dropped; nobody is left to tell
            let _ = reports_tx.send(DeliveryReport {
                accepted,
                scanned_at,
                result,
            });
        });
    }

    /// Sends dispatched but not yet reported
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Next finished send; None right away when nothing is in flight
    ///
    /// Cancel safe, so it can sit in a `select!` next to the scanner.
    pub async fn next_report(&mut self) -> Option<DeliveryReport> {
        if self.in_flight == 0 {
            return None;
        }
        let report = self.reports.recv().await?;
        self.in_flight -= 1;
        Some(report)
    }
}
