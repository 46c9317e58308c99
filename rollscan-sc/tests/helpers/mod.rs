//! Shared helpers for rollscan-sc integration tests
//!
//! `FakeEndpoint` serves the spreadsheet endpoint in-process with axum on
//! an ephemeral port so the real reqwest roster client and sink are used.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use rollscan_common::config::DeliveryConfig;
use rollscan_common::events::EventBus;
use rollscan_sc::delivery::{build_http_client, DeliveryQueue, HttpSink};
use rollscan_sc::scan::HttpRosterClient;
use rollscan_sc::session::ScanSession;
use rollscan_sc::store::StateStore;

#[derive(Default)]
struct FakeState {
    rosters: Mutex<HashMap<String, Vec<Value>>>,
    failing_batches: Mutex<Vec<String>>,
    posts: Mutex<Vec<HashMap<String, String>>>,
    roster_requests: AtomicUsize,
}

/// In-process stand-in for the spreadsheet web app
pub struct FakeEndpoint {
    addr: SocketAddr,
    state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl FakeEndpoint {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());

        let router = Router::new()
            .route("/exec", get(roster).post(record))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake endpoint");
        let addr = listener.local_addr().expect("fake endpoint address");

        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("fake endpoint");
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}/exec", self.addr)
    }

    /// Register a roster of subject ids; display name and number derive from the id
    pub fn add_roster(&self, batch_id: &str, subject_ids: &[&str]) {
        let users = subject_ids
            .iter()
            .enumerate()
            .map(|(i, uid)| {
                json!({
                    "uid": uid,
                    "did": "DEV-1",
                    "cid": "CS101",
                    "sid": 7,
                    "name": format!("Student {uid}"),
                    "nim": 2100 + i as u64,
                })
            })
            .collect();
        self.state
            .rosters
            .lock()
            .unwrap()
            .insert(batch_id.to_string(), users);
    }

    /// Make roster lookups for `batch_id` answer HTTP 500
    pub fn fail_roster(&self, batch_id: &str) {
        self.state
            .failing_batches
            .lock()
            .unwrap()
            .push(batch_id.to_string());
    }

    pub fn roster_requests(&self) -> usize {
        self.state.roster_requests.load(Ordering::SeqCst)
    }

    /// Every form posted so far, oldest first
    pub fn posts(&self) -> Vec<HashMap<String, String>> {
        self.state.posts.lock().unwrap().clone()
    }

    /// JSON record carried in post `index` under `field`
    pub fn posted_record(&self, index: usize, field: &str) -> Value {
        let posts = self.posts();
        serde_json::from_str(&posts[index][field]).expect("posted record is JSON")
    }
}

impl Drop for FakeEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn roster(
    State(state): State<Arc<FakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.roster_requests.fetch_add(1, Ordering::SeqCst);

    if params.get("action").map(String::as_str) != Some("getBatch") {
        return (StatusCode::BAD_REQUEST, "unknown action").into_response();
    }
    let batch_id = params.get("batch_id").cloned().unwrap_or_default();

    if state.failing_batches.lock().unwrap().contains(&batch_id) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }

    match state.rosters.lock().unwrap().get(&batch_id) {
        Some(users) => Json(json!({ "status": "success", "users": users })).into_response(),
        None => Json(json!({ "status": "error", "message": "batch not found" })).into_response(),
    }
}

async fn record(
    State(state): State<Arc<FakeState>>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    state.posts.lock().unwrap().push(form);
    // The client never reads this
    Json(json!({ "status": "success" }))
}

/// URL of a port nothing listens on
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("throwaway address");
    drop(listener);
    format!("http://{}/exec", addr)
}

/// URL of a server that accepts connections and never answers
///
/// The returned task holds the sockets open; abort it to let them go.
pub async fn silent_url() -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind silent endpoint");
    let addr = listener.local_addr().expect("silent endpoint address");

    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    (format!("http://{}/exec", addr), task)
}

/// Session wired to real HTTP collaborators
pub fn http_session(
    store: Arc<dyn StateStore>,
    roster_url: &str,
    sink_url: &str,
    events: EventBus,
) -> ScanSession {
    let client = build_http_client().expect("http client");
    let roster = Arc::new(HttpRosterClient::new(client.clone(), roster_url));
    let delivery = DeliveryQueue::new(
        Arc::new(HttpSink::new(client, sink_url)),
        DeliveryConfig::default(),
    );
    ScanSession::open(store, 10, roster, delivery, events).expect("open session")
}
