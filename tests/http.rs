//! HTTP tests driving the full route table over a real socket.

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::post;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use modelhub_gateway::client::ClientManager;
use modelhub_gateway::config::Config;
use modelhub_gateway::gateway_util::AppStateData;
use modelhub_gateway::idempotency::IdempotencyStore;
use modelhub_gateway::instance::{InstanceStore, ModelInstance};
use modelhub_gateway::router::Router;
use modelhub_gateway::routes::build_router;
use modelhub_gateway::settings::Settings;

/// Mock upstream that records the headers of the last request it served.
async fn spawn_upstream(
    body: &'static str,
) -> (SocketAddr, Arc<Mutex<Option<HeaderMap>>>) {
    let seen_headers: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
    let recorder = seen_headers.clone();
    let app = axum::Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap| {
            let recorder = recorder.clone();
            async move {
                *recorder.lock().unwrap() = Some(headers);
                Response::builder()
                    .status(200)
                    .header("content-type", "text/event-stream")
                    .body(Body::from(body))
                    .unwrap()
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen_headers)
}

async fn spawn_gateway(instances: Vec<ModelInstance>) -> SocketAddr {
    let router = Router::new(
        Settings::default(),
        InstanceStore::new_static(instances),
        Arc::new(ClientManager::new()),
    )
    .await
    .unwrap();
    let app_state = AppStateData {
        config: Arc::new(Config::default()),
        router: Arc::new(router),
        idempotency: Arc::new(IdempotencyStore::new_memory()),
    };
    let app = build_router(app_state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn instance_for(id: &str, provider: &str, upstream: SocketAddr) -> ModelInstance {
    serde_json::from_value(json!({
        "id": id,
        "provider": provider,
        "model_name": "gpt-4o-mini",
        "url": format!("http://{upstream}/v1/chat/completions"),
        "api_key": "sk-test",
    }))
    .unwrap()
}

#[tokio::test]
async fn test_empty_message_is_400() {
    let gateway = spawn_gateway(vec![]).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .json(&json!({"message": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_no_instances_is_503() {
    let gateway = spawn_gateway(vec![]).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_streaming_round_trip_and_outbound_headers() {
    let (upstream, seen_headers) = spawn_upstream(
        "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n",
    )
    .await;
    let gateway = spawn_gateway(vec![instance_for("a", "azure", upstream)]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .json(&json!({"message": "hello", "idempotencyKey": "key-42"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = response.text().await.unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    let chunk: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(chunk["id"], json!("x"));
    assert_eq!(chunk["object"], json!("chat.completion.chunk"));
    assert_eq!(lines[1], "[DONE]");

    // Outbound contract: bearer auth, the azure api-key duplicate, and the
    // idempotency headers
    let headers = seen_headers.lock().unwrap().clone().unwrap();
    assert_eq!(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer sk-test")
    );
    assert_eq!(
        headers.get("api-key").and_then(|v| v.to_str().ok()),
        Some("sk-test")
    );
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("key-42")
    );
    assert_eq!(
        headers.get("idempotency-key").and_then(|v| v.to_str().ok()),
        Some("key-42")
    );
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
}

#[tokio::test]
async fn test_non_azure_provider_has_no_api_key_header() {
    let (upstream, seen_headers) = spawn_upstream("data: [DONE]\n\n").await;
    let gateway = spawn_gateway(vec![instance_for("a", "openai", upstream)]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.text().await.unwrap();

    let headers = seen_headers.lock().unwrap().clone().unwrap();
    assert!(headers.get("api-key").is_none());
    assert!(headers.get("authorization").is_some());
}

#[tokio::test]
async fn test_settings_get_put_round_trip() {
    let gateway = spawn_gateway(vec![]).await;
    let client = reqwest::Client::new();

    let settings: serde_json::Value = client
        .get(format!("http://{gateway}/admin/settings"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["algorithm"], json!("sampled"));

    let mut updated = settings.clone();
    updated["algorithm"] = json!("scored");
    updated["queue_capacity"] = json!(1_000_000);
    let applied: serde_json::Value = client
        .put(format!("http://{gateway}/admin/settings"))
        .json(&updated)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(applied["algorithm"], json!("scored"));
    // Out-of-range values are clamped on ingestion
    assert_eq!(applied["queue_capacity"], json!(65_536));

    let statuses: serde_json::Value = client
        .get(format!("http://{gateway}/admin/strategies"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(statuses[0]["algorithm"], json!("scored"));
    assert_eq!(statuses[0]["state"], json!("ACTIVE"));
    assert!(statuses[0]["bucket_boundaries"].is_array());
    assert!(statuses[0]["bucket_weights"].is_array());
}

#[tokio::test]
async fn test_status_and_health() {
    let gateway = spawn_gateway(vec![]).await;
    let client = reqwest::Client::new();

    let status: serde_json::Value = client
        .get(format!("http://{gateway}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["name"], json!("modelhub-gateway"));

    let health: serde_json::Value = client
        .get(format!("http://{gateway}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], json!("ok"));
    assert_eq!(health["healthy_instances"], json!(false));
}

#[tokio::test]
async fn test_malformed_json_body_is_400() {
    let gateway = spawn_gateway(vec![]).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
