//! Control-plane client behavior against a live mock server:
//! no-work and conflict handling, the reactive refresh-and-retry on 401,
//! and rotating refresh-token persistence.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use kraken_agent::auth::{AuthManager, FileTokenStore, TokenStore};
use kraken_agent::client::{ControlPlaneApi, ControlPlaneClient, PollResponse};
use kraken_agent::types::{AgentState, AgentStatus, StatusEnvelope};

/// Scripted control plane: the first next-task call answers with
/// `first_status`, every later one returns a Deploy task. The auth side
/// hands out a numbered token pair per refresh.
struct MockServer {
    first_status: StatusCode,
    next_task_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    bearer_headers: Mutex<Vec<String>>,
}

impl MockServer {
    fn new(first_status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            first_status,
            next_task_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            bearer_headers: Mutex::new(Vec::new()),
        })
    }
}

async fn next_task(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
) -> axum::response::Response {
    let call = server.next_task_calls.fetch_add(1, Ordering::SeqCst);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    server.bearer_headers.lock().unwrap().push(bearer);

    if call == 0 && server.first_status != StatusCode::OK {
        return server.first_status.into_response();
    }
    Json(serde_json::json!({
        "Id": Uuid::new_v4(),
        "Type": "Deploy",
        "Payload": {}
    }))
    .into_response()
}

async fn refresh(State(server): State<Arc<MockServer>>) -> axum::response::Response {
    let call = server.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    Json(serde_json::json!({
        "accessToken": format!("at-{call}"),
        "expiresIn": 3600,
        "refreshToken": format!("rt-rotated-{call}"),
    }))
    .into_response()
}

async fn spawn_server(server: Arc<MockServer>) -> String {
    let app = Router::new()
        .route(
            "/organization/:org/workspaces/:ws/agents/:id/next-task",
            post(next_task),
        )
        .route("/agent/refresh", post(refresh))
        .with_state(server);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn envelope() -> StatusEnvelope {
    StatusEnvelope {
        agent_version: "0.0.0-test".to_string(),
        status: AgentStatus::Healthy,
        state: AgentState::Waiting,
        cpu_usage_percent: 0.0,
        ram_usage_mb: 0,
        total_ram_mb: 0,
        disk_total_gb: 0.0,
        disk_free_gb: 0.0,
        agent_uptime: "00:00:00:01".to_string(),
        ip_address: "Unknown".to_string(),
        operating_system: "Unknown".to_string(),
    }
}

struct Harness {
    client: ControlPlaneClient,
    auth: Arc<AuthManager>,
    store: Arc<FileTokenStore>,
    server: Arc<MockServer>,
    _dir: tempfile::TempDir,
}

async fn harness(first_status: StatusCode) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTokenStore::new("test", dir.path()));
    store.save("rt-original").await.unwrap();

    let server = MockServer::new(first_status);
    let base = spawn_server(server.clone()).await;

    let agent_id = Uuid::new_v4();
    let auth = Arc::new(AuthManager::new(store.clone(), base.clone(), agent_id).unwrap());
    let client = ControlPlaneClient::new(auth.clone(), base, "org-42", "ws-main", agent_id);

    Harness {
        client,
        auth,
        store,
        server,
        _dir: dir,
    }
}

#[tokio::test]
async fn no_content_means_no_work() {
    let h = harness(StatusCode::NO_CONTENT).await;
    let response = h.client.next_task(&envelope()).await.unwrap();
    assert!(matches!(response, PollResponse::NoWork));
}

#[tokio::test]
async fn conflict_is_benign() {
    let h = harness(StatusCode::CONFLICT).await;
    let response = h.client.next_task(&envelope()).await.unwrap();
    assert!(matches!(response, PollResponse::Conflict));
}

#[tokio::test]
async fn server_error_reports_the_code() {
    let h = harness(StatusCode::INTERNAL_SERVER_ERROR).await;
    let response = h.client.next_task(&envelope()).await.unwrap();
    assert!(matches!(response, PollResponse::ServerError(500)));
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTokenStore::new("test", dir.path()));
    let auth =
        Arc::new(AuthManager::new(store, "http://127.0.0.1:1", Uuid::new_v4()).unwrap());
    let client =
        ControlPlaneClient::new(auth, "http://127.0.0.1:1", "org", "ws", Uuid::new_v4());

    assert!(client.next_task(&envelope()).await.is_err());
}

#[tokio::test]
async fn refresh_rotates_the_on_disk_blob() {
    let h = harness(StatusCode::OK).await;
    assert!(h.auth.refresh().await);

    assert_eq!(
        h.store.load().await.unwrap().as_deref(),
        Some("rt-rotated-1")
    );
    let state = h.auth.state().await;
    assert_eq!(state.access_token, "at-1");
    assert_eq!(state.refresh_token, "rt-rotated-1");
}

#[tokio::test]
async fn consecutive_refreshes_never_lose_writes() {
    let h = harness(StatusCode::OK).await;
    assert!(h.auth.refresh().await);
    assert!(h.auth.refresh().await);

    // the second refresh observed and replaced the first one's tokens
    let state = h.auth.state().await;
    assert_eq!(state.access_token, "at-2");
    assert_eq!(state.refresh_token, "rt-rotated-2");
    assert_eq!(
        h.store.load().await.unwrap().as_deref(),
        Some("rt-rotated-2")
    );
}

#[tokio::test]
async fn unauthorized_triggers_one_refresh_and_one_retry() {
    let h = harness(StatusCode::UNAUTHORIZED).await;

    // prime a valid access token so the poll starts authenticated
    assert!(h.auth.refresh().await);
    assert_eq!(h.server.refresh_calls.load(Ordering::SeqCst), 1);

    let response = h.client.next_task(&envelope()).await.unwrap();
    let PollResponse::Task(task) = response else {
        panic!("expected a task after the retried request");
    };
    assert_eq!(task.task_type, "Deploy");

    // one reactive refresh, two next-task attempts
    assert_eq!(h.server.refresh_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.server.next_task_calls.load(Ordering::SeqCst), 2);

    // the retry went out with the rotated access token
    let headers = h.server.bearer_headers.lock().unwrap().clone();
    assert_eq!(headers, vec!["Bearer at-1", "Bearer at-2"]);

    // and the rotated refresh token reached the blob
    assert_eq!(
        h.store.load().await.unwrap().as_deref(),
        Some("rt-rotated-2")
    );
}
