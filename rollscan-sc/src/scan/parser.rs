//! Payload parser
//!
//! Turns untrusted decoded text into a [`ScanPayload`]. Three shapes are
//! recognized, in order:
//! 1. JSON object carrying the four attendance identifiers (inline)
//! 2. JSON object carrying a `batch_id` and none of the identifier keys
//!    (batch reference)
//! 3. Non-JSON text splitting into exactly four non-empty fields on
//!    `, | ; :` or whitespace
//!
//! Anything else is [`ParseError::Malformed`]. Pure function, no I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const SUBJECT_KEYS: &[&str] = &["user_id", "uid"];
const DEVICE_KEYS: &[&str] = &["device_id", "did"];
const COURSE_KEYS: &[&str] = &["course_id", "cid"];
const SESSION_KEYS: &[&str] = &["session_id", "sid"];
const NAME_KEYS: &[&str] = &["nama_user", "name"];
const NUMBER_KEYS: &[&str] = &["nim_user", "nim"];
const BATCH_KEYS: &[&str] = &["batch_id"];

/// A well-formed attendance record
///
/// The four identifiers are always non-empty; display fields are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub subject_id: String,
    pub device_id: String,
    pub course_id: String,
    pub session_id: String,
    pub display_name: Option<String>,
    pub subject_number: Option<String>,
}

impl AttendanceRecord {
    /// Record with only the required identifiers
    pub fn new(
        subject_id: impl Into<String>,
        device_id: impl Into<String>,
        course_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            device_id: device_id.into(),
            course_id: course_id.into(),
            session_id: session_id.into(),
            display_name: None,
            subject_number: None,
        }
    }
}

/// Recognized payload shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPayload {
    /// All attendance fields are carried in the code itself
    Inline(AttendanceRecord),
    /// Master code pointing at a remote roster
    BatchRef { batch_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Raw text kept verbatim for the audit trail
    #[error("Unrecognized scan payload: {raw:?}")]
    Malformed { raw: String },
}

impl ParseError {
    pub fn raw(&self) -> &str {
        match self {
            ParseError::Malformed { raw } => raw,
        }
    }
}

/// Parse decoded text into a payload
pub fn parse(raw: &str) -> Result<ScanPayload, ParseError> {
    let text = raw.trim();
    let malformed = || ParseError::Malformed {
        raw: raw.to_string(),
    };

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => from_object(&obj).ok_or_else(malformed),
        // Valid JSON of another shape is never re-read as delimited text
        Ok(_) => Err(malformed()),
        Err(_) => from_delimited(text).ok_or_else(malformed),
    }
}

fn from_object(obj: &Map<String, Value>) -> Option<ScanPayload> {
    let subject = field(obj, SUBJECT_KEYS);
    let device = field(obj, DEVICE_KEYS);
    let course = field(obj, COURSE_KEYS);
    let session = field(obj, SESSION_KEYS);

    if let (Some(subject_id), Some(device_id), Some(course_id), Some(session_id)) =
        (subject, device, course, session)
    {
        return Some(ScanPayload::Inline(AttendanceRecord {
            subject_id,
            device_id,
            course_id,
            session_id,
            display_name: field(obj, NAME_KEYS),
            subject_number: field(obj, NUMBER_KEYS),
        }));
    }

    // A partial inline record with a batch id attached is not a master code
    let has_identifier = [SUBJECT_KEYS, DEVICE_KEYS, COURSE_KEYS, SESSION_KEYS]
        .iter()
        .flat_map(|keys| keys.iter())
        .any(|key| obj.contains_key(*key));
    if has_identifier {
        return None;
    }

    field(obj, BATCH_KEYS).map(|batch_id| ScanPayload::BatchRef { batch_id })
}

/// First non-empty value among `keys`; numbers are accepted and stringified
fn field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn is_delimiter(c: char) -> bool {
    matches!(c, ',' | '|' | ';' | ':') || c.is_whitespace()
}

/// Split on delimiter runs; None if any field is empty
///
/// A run may mix whitespace with at most one punctuation delimiter, so
/// `"a , b"` is two fields while `"a,,b"`, `",a"` and `"a,"` carry an
/// empty one.
fn split_fields(text: &str) -> Option<Vec<&str>> {
    let mut fields = Vec::new();
    let mut field_start = None;
    let mut marks = 0;

    for (i, c) in text.char_indices() {
        if !is_delimiter(c) {
            if field_start.is_none() {
                field_start = Some(i);
            }
            continue;
        }
        if let Some(start) = field_start.take() {
            fields.push(&text[start..i]);
            marks = 0;
        }
        if !c.is_whitespace() {
            marks += 1;
            if fields.is_empty() || marks > 1 {
                return None;
            }
        }
    }

    fields.push(&text[field_start?..]);
    Some(fields)
}

fn from_delimited(text: &str) -> Option<ScanPayload> {
    let tokens = split_fields(text)?;

    match tokens.as_slice() {
        [subject, device, course, session] => Some(ScanPayload::Inline(AttendanceRecord::new(
            *subject, *device, *course, *session,
        ))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(raw: &str) -> AttendanceRecord {
        match parse(raw).unwrap() {
            ScanPayload::Inline(record) => record,
            other => panic!("expected inline payload, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_json_all_fields() {
        let record = inline(
            r#"{"user_id":"U1","device_id":"D1","course_id":"C1","session_id":"S1",
                "nama_user":"Ayu","nim_user":"2101"}"#,
        );
        assert_eq!(record.subject_id, "U1");
        assert_eq!(record.device_id, "D1");
        assert_eq!(record.course_id, "C1");
        assert_eq!(record.session_id, "S1");
        assert_eq!(record.display_name.as_deref(), Some("Ayu"));
        assert_eq!(record.subject_number.as_deref(), Some("2101"));
    }

    #[test]
    fn test_inline_json_short_keys_and_numbers() {
        let record = inline(r#"{"uid":7,"did":"D","cid":"C","sid":3,"nim":2101}"#);
        assert_eq!(record.subject_id, "7");
        assert_eq!(record.session_id, "3");
        assert_eq!(record.subject_number.as_deref(), Some("2101"));
        assert!(record.display_name.is_none());
    }

    #[test]
    fn test_inline_json_missing_field_is_malformed() {
        let raw = r#"{"user_id":"U1","device_id":"D1","course_id":"C1"}"#;
        assert_eq!(
            parse(raw),
            Err(ParseError::Malformed {
                raw: raw.to_string()
            })
        );
    }

    #[test]
    fn test_inline_json_blank_field_is_malformed() {
        let raw = r#"{"user_id":"U1","device_id":"  ","course_id":"C1","session_id":"S1"}"#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn test_two_field_json_is_not_reparsed_as_delimited() {
        // Splitting this on ':' and ',' would give four tokens
        let raw = r#"{"user_id":"a","device_id":"b"}"#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn test_batch_reference() {
        assert_eq!(
            parse(r#"{"batch_id":"ABSENSI-001"}"#).unwrap(),
            ScanPayload::BatchRef {
                batch_id: "ABSENSI-001".to_string()
            }
        );
    }

    #[test]
    fn test_complete_inline_wins_over_batch_id() {
        let record = inline(
            r#"{"batch_id":"B","user_id":"U","device_id":"D","course_id":"C","session_id":"S"}"#,
        );
        assert_eq!(record.subject_id, "U");
    }

    #[test]
    fn test_batch_id_with_partial_identifiers_is_malformed() {
        assert!(parse(r#"{"batch_id":"B","user_id":"U1"}"#).is_err());
        assert!(parse(r#"{"batch_id":"B","uid":"U1","did":"D1","cid":"C1"}"#).is_err());
        assert!(parse(r#"{"batch_id":"B","session_id":""}"#).is_err());
        // Display fields alone do not spoil a master code
        assert!(matches!(
            parse(r#"{"batch_id":"B","nama_user":"Ayu"}"#),
            Ok(ScanPayload::BatchRef { .. })
        ));
    }

    #[test]
    fn test_empty_batch_id_is_malformed() {
        assert!(parse(r#"{"batch_id":""}"#).is_err());
        assert!(parse("{}").is_err());
    }

    #[test]
    fn test_delimited_variants() {
        for raw in ["U1,D1,C1,S1", "U1|D1|C1|S1", "U1;D1;C1;S1", "U1:D1:C1:S1", "U1 D1 C1 S1", "U1, D1, C1, S1"] {
            let record = inline(raw);
            assert_eq!(record, AttendanceRecord::new("U1", "D1", "C1", "S1"), "raw = {raw}");
        }
    }

    #[test]
    fn test_delimited_wrong_token_count() {
        assert!(parse("U1,D1,C1").is_err());
        assert!(parse("U1,D1,C1,S1,X").is_err());
    }

    #[test]
    fn test_delimited_empty_field_is_malformed() {
        // Five fields with one empty must not collapse into four
        assert!(parse("U1,D1,,C1,S1").is_err());
        assert!(parse("U1||D1|C1|S1").is_err());
        assert!(parse(",U1,D1,C1,S1").is_err());
        assert!(parse("U1,D1,C1,S1,").is_err());
        assert!(parse("U1, ,D1,C1").is_err());
    }

    #[test]
    fn test_delimited_mixed_whitespace_runs() {
        assert_eq!(
            inline("U1 ,  D1\tC1 | S1"),
            AttendanceRecord::new("U1", "D1", "C1", "S1")
        );
    }

    #[test]
    fn test_not_json_is_malformed_with_raw_text() {
        let err = parse("not json").unwrap_err();
        assert_eq!(err.raw(), "not json");
    }

    #[test]
    fn test_json_scalar_is_malformed() {
        assert!(parse("\"U1,D1,C1,S1\"").is_err());
        assert!(parse("12345").is_err());
        assert!(parse("").is_err());
    }
}
