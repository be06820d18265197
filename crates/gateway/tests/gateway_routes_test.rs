use axum::body::Body;
use axum::http::{header::RETRY_AFTER, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use taskfleet_core::config::{AuthMode, GatewayConfig, RateLimitConfig, WorkerCredential};
use taskfleet_core::models::{ResultMessage, RuntimeStatus};
use taskfleet_core::partitions;
use taskfleet_core::signing::{self, HEADER_API_KEY, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP, HEADER_WORKER_ID};
use taskfleet_core::traits::{TaskQueue, WorkerRegistry};
use taskfleet_gateway::{create_routes, AppState};
use taskfleet_infrastructure::{InMemoryStreamQueue, InMemoryWorkerRegistry};

struct Gateway {
    app: Router,
    queue: Arc<InMemoryStreamQueue>,
    registry: Arc<InMemoryWorkerRegistry>,
}

fn gateway(rate_limit: RateLimitConfig) -> Gateway {
    let config = GatewayConfig {
        rate_limit,
        credentials: vec![
            WorkerCredential {
                worker_id: "w1".to_string(),
                mode: AuthMode::ApiKey,
                secret: Some("key-1".to_string()),
                cert_subject: None,
            },
            WorkerCredential {
                worker_id: "w2".to_string(),
                mode: AuthMode::Hmac,
                secret: Some("secret-2".to_string()),
                cert_subject: None,
            },
        ],
        ..Default::default()
    };
    let queue = Arc::new(InMemoryStreamQueue::new());
    let registry = Arc::new(InMemoryWorkerRegistry::new());
    let app = create_routes(AppState::new(&config, queue.clone(), registry.clone()));
    Gateway { app, queue, registry }
}

fn default_gateway() -> Gateway {
    gateway(RateLimitConfig::default())
}

fn api_key_request(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(HEADER_WORKER_ID, "w1")
        .header(HEADER_API_KEY, "key-1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn signed_request(path: &str, body: &Value, nonce: &str) -> Request<Body> {
    let timestamp = chrono::Utc::now().timestamp();
    let signature = signing::sign("secret-2", timestamp, nonce, body).unwrap();
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(HEADER_WORKER_ID, "w2")
        .header(HEADER_TIMESTAMP, timestamp.to_string())
        .header(HEADER_NONCE, nonce)
        .header(HEADER_SIGNATURE, signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn heartbeat_body(worker_id: &str) -> Value {
    json!({
        "heartbeat": {
            "worker_id": worker_id,
            "boot_id": "b1",
            "hostname": "host",
            "status": "online",
            "transport": "proxied",
            "cpu_percent": 1.0,
            "memory_percent": 2.0,
            "disk_percent": 3.0,
            "running_tasks": 0,
            "max_concurrency": 4,
            "version": "0.1.0",
            "os": "linux",
            "capabilities": {},
            "resource_limits": {},
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
        "ttl_seconds": 30
    })
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let gw = default_gateway();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&gw.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let gw = default_gateway();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/tasks/poll")
        .header("content-type", "application/json")
        .body(Body::from(json!({"boot_id": "b1", "count": 1}).to_string()))
        .unwrap();
    let (status, body) = send(&gw.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "AUTHENTICATION_ERROR");
}

#[tokio::test]
async fn test_poll_and_ack_own_partition() {
    let gw = default_gateway();
    gw.queue
        .enqueue(&partitions::tasks("w1"), &json!({"execution_id": "e1"}))
        .await
        .unwrap();
    gw.queue
        .enqueue(&partitions::tasks("w2"), &json!({"execution_id": "e2"}))
        .await
        .unwrap();

    let (status, body) = send(
        &gw.app,
        api_key_request("/v1/tasks/poll", json!({"boot_id": "b1", "count": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["payload"]["execution_id"], "e1");

    let entry_id = entries[0]["entry_id"].as_str().unwrap().to_string();
    let (status, body) = send(&gw.app, api_key_request("/v1/tasks/ack", json!({"entry_ids": [entry_id]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn test_invalid_boot_id_rejected() {
    let gw = default_gateway();
    let (status, _) = send(
        &gw.app,
        api_key_request("/v1/tasks/poll", json!({"boot_id": "", "count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_result_worker_id_is_rewritten() {
    let gw = default_gateway();
    let result = ResultMessage::runtime("e1", RuntimeStatus::Success).with_worker("w-someone-else");
    let (status, _) = send(
        &gw.app,
        api_key_request("/v1/results", serde_json::to_value(&result).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let entries = gw
        .queue
        .consume(partitions::RESULTS, partitions::DISPATCHERS_GROUP, "d", 10, None)
        .await
        .unwrap();
    let stored: ResultMessage = entries[0].decode().unwrap();
    assert_eq!(stored.worker_id.as_deref(), Some("w1"));
    assert_eq!(stored.run_id, "e1");
}

#[tokio::test]
async fn test_cannot_ack_other_workers_control_partition() {
    let gw = default_gateway();
    let (status, _) = send(
        &gw.app,
        api_key_request(
            "/v1/control/ack",
            json!({"partition": partitions::control("w2"), "entry_ids": ["1-1"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &gw.app,
        api_key_request(
            "/v1/control/ack",
            json!({"partition": partitions::GLOBAL_CONTROL, "entry_ids": ["1-1"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_control_reclaim_returns_unacked_entries() {
    let gw = default_gateway();
    gw.queue
        .enqueue(
            &partitions::control("w1"),
            &json!({"control_type": "cancel", "task_id": 1, "run_id": "e1", "reason": "user"}),
        )
        .await
        .unwrap();
    let group = partitions::control_group("w1");
    let crashed = gw
        .queue
        .consume(&partitions::control("w1"), &group, "w1:b0", 10, None)
        .await
        .unwrap();
    assert_eq!(crashed.len(), 1);

    let (status, body) = send(
        &gw.app,
        api_key_request("/v1/control/reclaim", json!({"boot_id": "b1", "min_idle_ms": 0, "count": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["payload"]["run_id"], "e1");
    assert_eq!(entries[0]["partition"], partitions::control("w1"));

    let pending = gw.queue.pending(&partitions::control("w1"), &group).await.unwrap();
    assert_eq!(pending[0].consumer, "w1:b1");
}

#[tokio::test]
async fn test_reply_stream_must_match_request() {
    let gw = default_gateway();
    let reply = json!({"request_id": "r1", "worker_id": "w1", "ok": true, "data": {}});
    let (status, _) = send(
        &gw.app,
        api_key_request("/v1/control/reply", json!({"reply_stream": "tasks:w2", "reply": reply})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &gw.app,
        api_key_request("/v1/control/reply", json!({"reply_stream": "reply:r1", "reply": reply})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.queue.len("reply:r1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_per_worker_rate_limit() {
    let gw = gateway(RateLimitConfig {
        global_rate_per_second: 100.0,
        global_burst: 100,
        per_worker_rate_per_second: 0.01,
        per_worker_burst: 2,
    });
    let body = json!({"entry_ids": []});
    for _ in 0..2 {
        let (status, _) = send(&gw.app, api_key_request("/v1/tasks/ack", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = gw
        .app
        .clone()
        .oneshot(api_key_request("/v1/tasks/ack", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(RETRY_AFTER));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["scope"], "worker");
    assert_eq!(body["limit"], 2);
    assert!(body["retry_after_seconds"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_hmac_heartbeat_and_replay() {
    let gw = default_gateway();
    let body = heartbeat_body("w2");

    let (status, _) = send(&gw.app, signed_request("/v1/heartbeat", &body, "nonce-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(gw.registry.probe("w2").await.unwrap());

    let (status, _) = send(&gw.app, signed_request("/v1/heartbeat", &body, "nonce-1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let spoofed = heartbeat_body("w1");
    let (status, _) = send(&gw.app, signed_request("/v1/heartbeat", &spoofed, "nonce-2")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
