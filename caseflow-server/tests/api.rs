//! Router tests against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use caseflow_core::{
    CaseStore, MemoryCaseStore, NotificationFanout, SessionOptions, TransitionCoordinator,
};
use caseflow_server::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use uuid::Uuid;

fn options() -> SessionOptions {
    SessionOptions {
        reorder_limit: 16,
        debounce: Duration::from_millis(10),
    }
}

fn app() -> Router {
    let store = Arc::new(MemoryCaseStore::new());
    let fanout = Arc::new(NotificationFanout::new(64));
    let coordinator = Arc::new(TransitionCoordinator::new(store));
    build_router(AppState::new(coordinator, fanout, options()))
}

/// App whose store changes reach queue streams. Keep the sender alive.
fn live_app() -> (Router, AppState, watch::Sender<bool>) {
    let store = Arc::new(MemoryCaseStore::new());
    let fanout = Arc::new(NotificationFanout::new(64));
    let (shutdown, rx) = watch::channel(false);
    fanout.spawn_relay(store.subscribe(), rx);
    let coordinator = Arc::new(TransitionCoordinator::new(store));
    let state = AppState::new(coordinator, fanout, options());
    (build_router(state.clone()), state, shutdown)
}

fn request(method: Method, uri: &str, role: Option<&str>, body: Option<Value>) -> Request<Body> {
    request_as(method, uri, Uuid::new_v4(), role, body)
}

fn request_as(
    method: Method,
    uri: &str,
    user: Uuid,
    role: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(role) = role {
        builder = builder
            .header("x-user-id", user.to_string())
            .header("x-user-role", role);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Book and approve a case; returns its id and current revision.
async fn approved_case(app: &Router) -> (String, u64) {
    let (status, booked) = send(
        app,
        request(
            Method::POST,
            "/api/appointments",
            Some("admin"),
            Some(json!({
                "patient_id": Uuid::new_v4(),
                "case_type": "pre_employment",
                "scheduled_date": "2026-11-02"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = booked["appointment"]["id"].as_str().unwrap().to_string();

    let (status, approved) = send(
        app,
        request(
            Method::PATCH,
            &format!("/api/appointments/{id}/status"),
            Some("admin"),
            Some(json!({ "status": "approved", "expected_version": 1 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{approved}");
    (id, approved["revision"].as_u64().unwrap())
}

fn payment() -> Value {
    json!({
        "stage": "payment",
        "or_number": "OR-20931",
        "amount": "1850.00",
        "method": "cash"
    })
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let app = app();
    let (status, body) = send(
        &app,
        request(Method::GET, "/api/queues/cashier", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");
}

#[tokio::test]
async fn test_payment_then_stale_retry() {
    let app = app();
    let (id, revision) = approved_case(&app).await;
    let advance = json!({
        "status": "completed",
        "payload": payment(),
        "expected_version": revision
    });
    let uri = format!("/api/cases/{id}/stages/payment/advance");

    let (status, body) = send(
        &app,
        request(Method::POST, &uri, Some("cashier"), Some(advance.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["revision"], revision + 1);
    assert_eq!(body["snapshot"]["appointment"]["status"], "in_progress");

    let (status, body) = send(
        &app,
        request(Method::POST, &uri, Some("cashier"), Some(advance)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "stale_transition");
    assert_eq!(body["refresh"], true);

    let (status, body) = send(
        &app,
        request(Method::GET, &format!("/api/cases/{id}"), Some("nurse"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"]["payment"]["fields"]["or_number"], "OR-20931");
}

#[tokio::test]
async fn test_prerequisite_failure_maps_to_422() {
    let app = app();
    let (id, revision) = approved_case(&app).await;
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/cases/{id}/stages/triage/advance"),
            Some("nurse"),
            Some(json!({ "status": "completed", "expected_version": revision })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "prerequisite_not_met");
}

#[tokio::test]
async fn test_payload_for_wrong_stage_is_rejected() {
    let app = app();
    let (id, _) = approved_case(&app).await;
    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            &format!("/api/cases/{id}/stages/lab/draft"),
            Some("lab"),
            Some(payment()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn test_queue_visibility() {
    let app = app();
    let (id, _) = approved_case(&app).await;

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/queues/cashier", Some("cashier"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["snapshot"]["appointment"]["id"], id.as_str());

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/queues/cashier", Some("nurse"), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "role_not_permitted");

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/queues/nurse", Some("nurse"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_stream_opens_with_snapshot() {
    let app = app();
    approved_case(&app).await;

    let resp = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/api/queues/cashier/stream",
            Some("cashier"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut body = resp.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.starts_with("event: snapshot"), "{text}");
    assert!(text.contains("\"role\":\"cashier\""));
}

#[tokio::test]
async fn test_admin_has_no_stream() {
    let app = app();
    let (status, body) = send(
        &app,
        request(Method::GET, "/api/queues/admin/stream", Some("admin"), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "role_not_permitted");
}

/// Forward every SSE frame of a queue stream as text. Aborting the task
/// drops the response body.
async fn open_stream(
    app: &Router,
    user: Uuid,
    role: &str,
) -> (mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
    let resp = app
        .clone()
        .oneshot(request_as(
            Method::GET,
            &format!("/api/queues/{role}/stream"),
            user,
            Some(role),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (tx, rx) = mpsc::unbounded_channel();
    let mut body = resp.into_body();
    let reader = tokio::spawn(async move {
        while let Some(Ok(frame)) = body.frame().await {
            if let Ok(data) = frame.into_data() {
                if tx.send(String::from_utf8_lossy(&data).into_owned()).is_err() {
                    break;
                }
            }
        }
    });
    (rx, reader)
}

async fn next_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("frame within timeout")
        .expect("stream open")
}

fn frame_data(frame: &str) -> Value {
    let data = frame
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    serde_json::from_str(data).unwrap()
}

#[tokio::test]
async fn test_editing_view_is_closed_by_another_cashier() {
    let (app, state, _shutdown) = live_app();
    let (id, revision) = approved_case(&app).await;
    let me = Uuid::new_v4();

    let (mut frames, reader) = open_stream(&app, me, "cashier").await;
    let snapshot = frame_data(&next_frame(&mut frames).await);
    let stream_id = snapshot["stream_id"].as_str().unwrap().to_string();
    assert_eq!(state.streams.len(), 1);

    let (status, body) = send(
        &app,
        request_as(
            Method::POST,
            &format!("/api/queues/cashier/stream/{stream_id}/open/{id}"),
            me,
            Some("cashier"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["appointment"]["id"], id.as_str());

    // Someone else's identity cannot drive this stream.
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/queues/cashier/stream/{stream_id}/close"),
            Some("cashier"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/cases/{id}/stages/payment/advance"),
            Some("cashier"),
            Some(json!({
                "status": "completed",
                "payload": payment(),
                "expected_version": revision
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let mut seen = Vec::new();
    while !seen.iter().any(|f: &String| f.contains("editing_closed")) {
        seen.push(next_frame(&mut frames).await);
    }
    let update = seen.iter().find(|f| f.contains("editing_closed")).unwrap();
    assert!(update.starts_with("event: update"), "{update}");
    assert!(update.contains("case_already_processed"), "{update}");

    reader.abort();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !state.streams.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream deregistered");
}

#[tokio::test]
async fn test_advance_through_stream_releases_own_pin() {
    let (app, _state, _shutdown) = live_app();
    let (id, revision) = approved_case(&app).await;
    let me = Uuid::new_v4();

    let (mut frames, _reader) = open_stream(&app, me, "cashier").await;
    let stream_id = frame_data(&next_frame(&mut frames).await)["stream_id"]
        .as_str()
        .unwrap()
        .to_string();
    let base = format!("/api/queues/cashier/stream/{stream_id}");

    let (status, _) = send(
        &app,
        request_as(
            Method::POST,
            &format!("{base}/open/{id}"),
            me,
            Some("cashier"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        request_as(
            Method::POST,
            &format!("{base}/advance"),
            me,
            Some("cashier"),
            Some(json!({
                "case_id": id,
                "stage": "payment",
                "status": "completed",
                "payload": payment(),
                "expected_version": revision
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["revision"], revision + 1);

    let update = next_frame(&mut frames).await;
    assert!(update.starts_with("event: update"), "{update}");
    assert!(update.contains("\"removed\""), "{update}");
    assert!(!update.contains("editing_closed"), "{update}");

    let (status, body) = send(
        &app,
        request_as(Method::POST, &format!("{base}/close"), me, Some("cashier"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["deltas"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_stream_is_not_found() {
    let app = app();
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/queues/nurse/stream/{}/close", Uuid::new_v4()),
            Some("nurse"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_admin_assigns_physician() {
    let app = app();
    let (id, revision) = approved_case(&app).await;
    let doctor = Uuid::new_v4();
    let uri = format!("/api/cases/{id}/doctor");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/cases/{id}/stages/payment/advance"),
            Some("cashier"),
            Some(json!({
                "status": "completed",
                "payload": payment(),
                "expected_version": revision
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let revision = body["revision"].as_u64().unwrap();

    let assign = json!({ "doctor_id": doctor, "expected_version": revision });
    let (status, _) = send(
        &app,
        request(Method::POST, &uri, Some("physician"), Some(assign.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, request(Method::POST, &uri, Some("admin"), Some(assign))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["snapshot"]["stages"]["assigned_doctor_id"], doctor.to_string());
}

#[tokio::test]
async fn test_second_booking_for_open_case_conflicts() {
    let app = app();
    let patient = Uuid::new_v4();
    let booking = json!({
        "patient_id": patient,
        "case_type": "pre_employment",
        "scheduled_date": "2026-11-02"
    });

    let (status, _) = send(
        &app,
        request(Method::POST, "/api/appointments", Some("admin"), Some(booking.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        request(Method::POST, "/api/appointments", Some("admin"), Some(booking)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "open_case_exists");
}
