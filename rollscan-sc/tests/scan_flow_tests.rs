//! End-to-end scan flow against an in-process spreadsheet endpoint

mod helpers;

use std::sync::Arc;

use std::time::Duration;

use helpers::{http_session, silent_url, unreachable_url, FakeEndpoint};
use rollscan_common::events::{EventBus, ScanEvent, SessionStatus};
use rollscan_sc::decoder::{LineReader, ScannerHandle};
use rollscan_sc::history::OutcomeStatus;
use rollscan_sc::scan::Rejection;
use rollscan_sc::session::{ScanOutcome, ScanSession};
use rollscan_sc::store::{FileStore, StateStore, SCANNED_SUBJECTS_KEY};
use tempfile::TempDir;

const MASTER: &str = r#"{"batch_id":"KELAS-A"}"#;

fn file_store(dir: &TempDir) -> Arc<dyn StateStore> {
    Arc::new(FileStore::new(dir.path()))
}

fn subject_of(outcome: &ScanOutcome) -> (u32, String) {
    match outcome {
        ScanOutcome::Admitted(accepted) => {
            (accepted.scan_number, accepted.record.subject_id.clone())
        }
        other => panic!("expected admission, got {:?}", other),
    }
}

/// Handle one code and wait until its send has settled
async fn scan(session: &mut ScanSession, raw: &str) -> ScanOutcome {
    let outcome = session.handle_scan(raw).await;
    session.settle_deliveries().await;
    outcome
}

#[tokio::test]
async fn test_roll_call_in_roster_order() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A", "B", "C"]);
    let dir = TempDir::new().unwrap();
    let mut session = http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));

    assert_eq!(subject_of(&scan(&mut session, MASTER).await), (1, "A".to_string()));
    assert_eq!(subject_of(&scan(&mut session, MASTER).await), (2, "B".to_string()));
    assert_eq!(subject_of(&scan(&mut session, MASTER).await), (3, "C".to_string()));
    assert!(matches!(
        scan(&mut session, MASTER).await,
        ScanOutcome::Rejected(Rejection::BatchExhausted { roster_len: 3, .. })
    ));

    assert_eq!(endpoint.roster_requests(), 1);
    let posts = endpoint.posts();
    assert_eq!(posts.len(), 3);
    assert_eq!(posts[0]["action"], "record_scan");

    let second = endpoint.posted_record(1, "data");
    assert_eq!(second["batch_id"], "KELAS-A");
    assert_eq!(second["scan_number"], 2);
    assert_eq!(second["user_id"], "B");
    assert_eq!(second["session_id"], "7");
    assert_eq!(second["nim_user"], "2101");
    assert_eq!(second["nama_user"], "Student B");
}

#[tokio::test]
async fn test_reload_continues_where_it_left_off() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A", "B", "C"]);
    let dir = TempDir::new().unwrap();

    {
        let mut session =
            http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));
        scan(&mut session, MASTER).await;
        scan(&mut session, MASTER).await;
    }

    let mut reloaded =
        http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));
    assert_eq!(reloaded.tracker().admitted(), 2);
    assert_eq!(reloaded.history().len(), 2);

    assert_eq!(subject_of(&scan(&mut reloaded, MASTER).await), (3, "C".to_string()));
    // The roster cache does not survive a reload
    assert_eq!(endpoint.roster_requests(), 2);
}

#[tokio::test]
async fn test_reset_refetches_roster() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A", "B"]);
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    let mut session = http_session(store.clone(), &endpoint.url(), &endpoint.url(), EventBus::new(64));

    scan(&mut session, MASTER).await;
    scan(&mut session, MASTER).await;
    session.reset().unwrap();

    assert!(store.read(SCANNED_SUBJECTS_KEY).unwrap().is_none());
    assert!(session.history().is_empty());

    assert_eq!(subject_of(&scan(&mut session, MASTER).await), (1, "A".to_string()));
    assert_eq!(endpoint.roster_requests(), 2);
}

#[tokio::test]
async fn test_failed_send_keeps_admission() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A", "B"]);
    let dir = TempDir::new().unwrap();
    let sink_url = unreachable_url().await;
    let mut session = http_session(file_store(&dir), &endpoint.url(), &sink_url, EventBus::new(64));

    let outcome = scan(&mut session, MASTER).await;

    assert_eq!(subject_of(&outcome), (1, "A".to_string()));
    assert_eq!(session.tracker().admitted(), 1);
    assert_eq!(session.history()[0].status, OutcomeStatus::Error);
    assert_eq!(session.history()[0].scan_number, Some(1));
    assert!(matches!(session.status(), SessionStatus::LastScanFailed(_)));

    // The next scan moves on instead of retrying A
    let next = scan(&mut session, MASTER).await;
    assert_eq!(subject_of(&next), (2, "B".to_string()));
    assert_eq!(session.history()[0].status, OutcomeStatus::Error);
}

#[tokio::test]
async fn test_silent_endpoint_does_not_stall_scanning() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A", "B", "C"]);
    let (sink_url, silent) = silent_url().await;
    let dir = TempDir::new().unwrap();
    let mut session = http_session(file_store(&dir), &endpoint.url(), &sink_url, EventBus::new(64));

    for expected in ["A", "B", "C"] {
        let outcome = tokio::time::timeout(Duration::from_secs(5), session.handle_scan(MASTER))
            .await
            .expect("scan waited on an unanswered send");
        assert_eq!(subject_of(&outcome).1, expected);
    }

    assert_eq!(session.tracker().admitted(), 3);
    assert_eq!(session.deliveries_in_flight(), 3);
    assert_eq!(*session.status(), SessionStatus::Sending);

    let settled = tokio::time::timeout(Duration::from_millis(200), session.settle_deliveries()).await;
    assert!(settled.is_err());
    silent.abort();
}

#[tokio::test]
async fn test_inline_scans_number_sequentially() {
    let endpoint = FakeEndpoint::start().await;
    let dir = TempDir::new().unwrap();
    let mut session = http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));

    assert_eq!(subject_of(&scan(&mut session, "U1|D1|C1|S1").await), (1, "U1".to_string()));
    let json = r#"{"user_id":"U2","device_id":"D1","course_id":"C1","session_id":"S1","nama_user":"Budi"}"#;
    assert_eq!(subject_of(&scan(&mut session, json).await), (2, "U2".to_string()));
    // Inline repeats are allowed
    assert_eq!(subject_of(&scan(&mut session, "U1|D1|C1|S1").await), (3, "U1".to_string()));

    let posts = endpoint.posts();
    assert_eq!(posts.len(), 3);
    assert!(!posts[0].contains_key("action"));
    let record = endpoint.posted_record(1, "barcode_data");
    assert_eq!(record["nama_user"], "Budi");
    assert_eq!(record["nim_user"], "");
    assert!(record.get("batch_id").is_none());
    assert_eq!(endpoint.roster_requests(), 0);
}

#[tokio::test]
async fn test_unknown_batch_and_roster_errors() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.fail_roster("BROKEN");
    let dir = TempDir::new().unwrap();
    let mut session = http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));

    assert!(matches!(
        scan(&mut session, r#"{"batch_id":"NOPE"}"#).await,
        ScanOutcome::Rejected(Rejection::UnknownBatch { .. })
    ));
    assert!(matches!(
        scan(&mut session, r#"{"batch_id":"BROKEN"}"#).await,
        ScanOutcome::AdmitFailed(_)
    ));

    assert_eq!(session.tracker().admitted(), 0);
    assert!(endpoint.posts().is_empty());
    assert_eq!(session.history().len(), 2);
    assert_eq!(session.history()[0].batch_id.as_deref(), Some("BROKEN"));
}

#[tokio::test]
async fn test_malformed_codes_do_not_stop_scanning() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A"]);
    let dir = TempDir::new().unwrap();
    let mut session = http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));

    assert!(matches!(scan(&mut session, "not json").await, ScanOutcome::Malformed(_)));
    assert!(matches!(scan(&mut session, "[1,2,3]").await, ScanOutcome::Malformed(_)));
    assert_eq!(subject_of(&scan(&mut session, MASTER).await), (1, "A".to_string()));

    let history = session.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].status, OutcomeStatus::Success);
    assert_eq!(history[2].subject_id, "N/A");
}

#[tokio::test]
async fn test_history_cap_survives_reload() {
    let endpoint = FakeEndpoint::start().await;
    let dir = TempDir::new().unwrap();

    {
        let mut session =
            http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));
        for i in 0..15 {
            scan(&mut session, &format!("U{i},D,C,S")).await;
        }
        assert_eq!(session.history().len(), 10);
    }

    let reloaded = http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), EventBus::new(64));
    let numbers: Vec<u32> = reloaded
        .history()
        .iter()
        .filter_map(|e| e.scan_number)
        .collect();
    assert_eq!(numbers, (6..=15).rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_run_consumes_reader_and_publishes_events() {
    let endpoint = FakeEndpoint::start().await;
    endpoint.add_roster("KELAS-A", &["A", "B"]);
    let dir = TempDir::new().unwrap();
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let mut session = http_session(file_store(&dir), &endpoint.url(), &endpoint.url(), events);
    session.login("desk-1");

    let input: &'static [u8] = b"{\"batch_id\":\"KELAS-A\"}\n\n\ngarbage\n{\"batch_id\":\"KELAS-A\"}\n";
    let mut scanner = ScannerHandle::start(LineReader::from_reader("fixture", input), 4)
        .await
        .unwrap();

    let processed = session.run(&mut scanner).await;
    scanner.shutdown().await;
    session.settle_deliveries().await;

    assert_eq!(processed, 3);
    assert_eq!(session.tracker().admitted(), 2);
    assert!(session
        .history()
        .iter()
        .all(|e| e.operator.as_deref() == Some("desk-1")));

    let mut accepted = Vec::new();
    let mut malformed = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            ScanEvent::ScanAccepted { subject_id, .. } => accepted.push(subject_id),
            ScanEvent::ScanMalformed { .. } => malformed += 1,
            _ => {}
        }
    }
    assert_eq!(accepted, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(malformed, 1);
}
