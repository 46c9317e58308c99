//! Batch roster collaborator
//!
//! A master code only names a batch; the ordered list of subjects lives
//! on the remote endpoint (`?action=getBatch&batch_id=...`).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::delivery::TransportError;
use crate::scan::parser::AttendanceRecord;

const ROSTER_TIMEOUT: Duration = Duration::from_secs(30);

/// One subject row of a roster
///
/// Spreadsheet cells may arrive as numbers, so every field accepts either.
/// Blank, null or missing identifier cells decode as empty strings so one bad
/// row does not sink the whole roster; see [`RosterEntry::is_complete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "uid", alias = "user_id", default, deserialize_with = "lenient_id")]
    pub subject_id: String,

    #[serde(rename = "did", alias = "device_id", default, deserialize_with = "lenient_id")]
    pub device_id: String,

    #[serde(rename = "cid", alias = "course_id", default, deserialize_with = "lenient_id")]
    pub course_id: String,

    #[serde(rename = "sid", alias = "session_id", default, deserialize_with = "lenient_id")]
    pub session_id: String,

    #[serde(
        rename = "name",
        alias = "nama_user",
        default,
        deserialize_with = "opt_string_or_number"
    )]
    pub display_name: Option<String>,

    #[serde(
        rename = "nim",
        alias = "nim_user",
        default,
        deserialize_with = "opt_string_or_number"
    )]
    pub subject_number: Option<String>,
}

impl RosterEntry {
    /// All four identifiers present; only complete rows can be admitted
    pub fn is_complete(&self) -> bool {
        [
            &self.subject_id,
            &self.device_id,
            &self.course_id,
            &self.session_id,
        ]
        .iter()
        .all(|id| !id.is_empty())
    }

    pub fn to_record(&self) -> AttendanceRecord {
        AttendanceRecord {
            subject_id: self.subject_id.clone(),
            device_id: self.device_id.clone(),
            course_id: self.course_id.clone(),
            session_id: self.session_id.clone(),
            display_name: self.display_name.clone(),
            subject_number: self.subject_number.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Num(serde_json::Number),
}

impl StringOrNumber {
    fn into_trimmed(self) -> String {
        match self {
            StringOrNumber::Str(s) => s.trim().to_string(),
            StringOrNumber::Num(n) => n.to_string(),
        }
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?
        .map(StringOrNumber::into_trimmed)
        .filter(|s| !s.is_empty()))
}

/// Ordered subjects for one batch, immutable once fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRoster {
    pub batch_id: String,
    pub entries: Vec<RosterEntry>,
}

impl BatchRoster {
    pub fn new(batch_id: impl Into<String>, entries: Vec<RosterEntry>) -> Self {
        Self {
            batch_id: batch_id.into(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wire shape of the roster response; a missing `users` key is an empty roster
#[derive(Debug, Deserialize)]
struct RosterResponse {
    #[serde(default)]
    users: Vec<RosterEntry>,
}

/// Source of batch rosters
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch(&self, batch_id: &str) -> Result<BatchRoster, TransportError>;
}

/// Roster lookup against the spreadsheet endpoint
pub struct HttpRosterClient {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpRosterClient {
    pub fn new(http_client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RosterSource for HttpRosterClient {
    async fn fetch(&self, batch_id: &str) -> Result<BatchRoster, TransportError> {
        debug!(batch_id, "Fetching roster");

        let response = self
            .http_client
            .get(&self.endpoint)
            .query(&[("action", "getBatch"), ("batch_id", batch_id)])
            .timeout(ROSTER_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body: RosterResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        info!(batch_id, subjects = body.users.len(), "Roster fetched");
        Ok(BatchRoster::new(batch_id, body.users))
    }
}
