//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to exercise the Axum router without a real HTTP
//! server, backed by the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use courier_api::routes::create_router;
use courier_api::state::AppState;
use courier_engine::audit::{
    AuditConfig, AuditEmitter, AuditError, AuditEvent, AuditSink, MemoryOverflowQueue, event_types,
};
use courier_engine::reconciler::{Reconcile, ReconcileError, ReconcileOutcome};
use courier_engine::store::MemoryStore;
use courier_engine::worker::{WorkerConfig, WorkerPool};

// ============================================================
// Helpers
// ============================================================

fn test_state() -> AppState {
    AppState::new(Arc::new(MemoryStore::new()))
}

async fn send(state: &AppState, request: Request<Body>) -> Response {
    create_router(state.clone()).oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post_notification(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/notifications")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn valid_spec() -> Value {
    json!({
        "subject": "Backup failed",
        "body": "nightly backup of db-2 exited with code 1",
        "priority": "critical",
        "channels": ["console", "ops-hook"],
        "recipients": [{"address": "oncall@example.com"}],
        "correlation_id": "wf-backup-7"
    })
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReconciler {
    seen: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl Reconcile for RecordingReconciler {
    async fn reconcile(&self, id: Uuid) -> Result<ReconcileOutcome, ReconcileError> {
        self.seen.lock().unwrap().push(id);
        Ok(ReconcileOutcome::Done)
    }
}

// ============================================================
// Routes
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let response = send(&test_state(), get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "courier-api");
}

#[tokio::test]
async fn test_create_and_fetch_notification() {
    let state = test_state();

    let response = send(&state, post_notification(&valid_spec())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["status"]["phase"], "Pending");
    assert_eq!(created["spec"]["priority"], "critical");
    let id = created["id"].as_str().unwrap().to_string();

    let response = send(&state, get(&format!("/notifications/{}", id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], id.as_str());
    assert_eq!(fetched["spec"]["channels"], json!(["console", "ops-hook"]));
}

#[tokio::test]
async fn test_get_unknown_notification_is_404() {
    let response = send(
        &test_state(),
        get(&format!("/notifications/{}", Uuid::new_v4())),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_admission_rejects_invalid_specs() {
    let state = test_state();
    let cases = [
        json!({"subject": "", "body": "b", "channels": ["console"]}),
        json!({"subject": "s", "body": "b", "channels": []}),
        json!({"subject": "s", "body": "b", "channels": ["console", "console"]}),
        json!({"subject": "s", "body": "b", "channels": ["console"], "recipients": [{"address": " "}]}),
        json!({"subject": "s", "body": "b", "channels": ["console"], "retry_policy": {"max_attempts": 0}}),
        json!({"subject": "s", "body": "b", "channels": ["console"],
               "retry_policy": {"initial_backoff_seconds": 60, "max_backoff_seconds": 5}}),
    ];

    for spec in cases {
        let response = send(&state, post_notification(&spec)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", spec);
        let json = body_json(response).await;
        assert!(json["error"].as_str().is_some_and(|e| !e.is_empty()));
    }

    let response = send(&state, get("/notifications")).await;
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn test_list_filters_by_phase() {
    let state = test_state();
    for _ in 0..3 {
        send(&state, post_notification(&valid_spec())).await;
    }

    let response = send(&state, get("/notifications?phase=Pending&limit=2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

    let response = send(&state, get("/notifications?phase=Sent")).await;
    assert_eq!(body_json(response).await, json!([]));

    let response = send(&state, get("/notifications?phase=bogus")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_emits_audit_event() {
    let sink = Arc::new(RecordingSink::default());
    let audit = AuditEmitter::start(
        AuditConfig::default(),
        sink.clone(),
        Arc::new(MemoryOverflowQueue::new(10)),
    );
    let state = test_state().with_audit(audit.clone());

    let response = send(&state, post_notification(&valid_spec())).await;
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    assert!(audit.shutdown(Duration::from_secs(5)).await);
    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::REQUEST_CREATED);
    assert_eq!(events[0].actor, "courier-api");
    assert_eq!(events[0].correlation_id, "wf-backup-7");
    assert_eq!(events[0].resource.id, id);
}

#[tokio::test]
async fn test_create_enqueues_reconcile() {
    let reconciler = Arc::new(RecordingReconciler::default());
    let (pool, queue) = WorkerPool::new(reconciler.clone(), WorkerConfig::default());
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(pool.run(cancel.clone()));

    let state = test_state().with_queue(queue);
    let response = send(&state, post_notification(&valid_spec())).await;
    let id: Uuid = body_json(response).await["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    for _ in 0..50 {
        if !reconciler.seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*reconciler.seen.lock().unwrap(), vec![id]);

    cancel.cancel();
    worker.await.unwrap();
}
