//! End-to-end streaming tests against a local mock upstream.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::routing::post;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use modelhub_gateway::client::ClientManager;
use modelhub_gateway::error::Error;
use modelhub_gateway::idempotency::IdempotencyStore;
use modelhub_gateway::instance::{InstanceStore, ModelInstance};
use modelhub_gateway::pipeline::ChatParams;
use modelhub_gateway::router::Router;
use modelhub_gateway::settings::Settings;

async fn upstream_chunked(body: &'static str, delay: Duration) -> Response {
    tokio::time::sleep(delay).await;
    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

/// Serve `body` as the streaming response on an ephemeral port.
async fn spawn_upstream(body: &'static str, delay: Duration) -> SocketAddr {
    let app = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || upstream_chunked(body, delay)),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn upstream_instance(id: &str, addr: SocketAddr) -> ModelInstance {
    serde_json::from_value(json!({
        "id": id,
        "provider": "openai",
        "model_name": "gpt-4o-mini",
        "url": format!("http://{addr}/v1/chat/completions"),
        "api_key": "sk-test",
    }))
    .unwrap()
}

async fn gateway_for(instances: Vec<ModelInstance>) -> (Arc<Router>, Arc<IdempotencyStore>) {
    let router = Router::new(
        Settings::default(),
        InstanceStore::new_static(instances),
        Arc::new(ClientManager::new()),
    )
    .await
    .unwrap();
    (Arc::new(router), Arc::new(IdempotencyStore::new_memory()))
}

async fn body_to_lines(response: Response) -> Vec<String> {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_stream_normalized_to_client() {
    let addr = spawn_upstream(
        "data: {\"id\":\"x\",\"choices\":[{\"index\":3,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n",
        Duration::ZERO,
    )
    .await;
    let (router, idempotency) = gateway_for(vec![upstream_instance("a", addr)]).await;

    let params = ChatParams {
        message: "hello".to_string(),
        ..ChatParams::default()
    };
    let response =
        modelhub_gateway::endpoints::chat::chat_completions(router.clone(), idempotency, params)
            .await
            .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );

    let lines = body_to_lines(response).await;
    assert_eq!(lines.len(), 2);
    let chunk: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(
        chunk,
        json!({
            "id": "x",
            "object": "chat.completion.chunk",
            "model": "gpt-4o-mini",
            "choices": [{"index": 3, "delta": {"content": "hi"}}],
        })
    );
    assert_eq!(lines[1], "[DONE]");

    // Completion recorded on the instance and the queue slot released
    let statuses = router.statuses();
    assert_eq!(statuses[0].queue_depth, 0);
    assert_eq!(statuses[0].stats.admitted_total, 1);
}

#[tokio::test]
async fn test_raw_passthrough_stream() {
    let addr = spawn_upstream(
        "data: {\"anything\":\"goes\"}\n\ndata: [DONE]\n\n",
        Duration::ZERO,
    )
    .await;
    let mut instance = upstream_instance("a", addr);
    instance.raw_passthrough = true;
    let (router, idempotency) = gateway_for(vec![instance]).await;

    let params = ChatParams {
        message: "hello".to_string(),
        ..ChatParams::default()
    };
    let response = modelhub_gateway::endpoints::chat::chat_completions(router, idempotency, params)
        .await
        .unwrap();
    let lines = body_to_lines(response).await;
    assert_eq!(lines[0], "{\"anything\":\"goes\"}");
    assert_eq!(lines[1], "[DONE]");
}

#[tokio::test]
async fn test_duplicate_keys_one_conflict() {
    // The upstream stalls long enough that both requests overlap
    let addr = spawn_upstream("data: [DONE]\n\n", Duration::from_millis(300)).await;
    let (router, idempotency) = gateway_for(vec![upstream_instance("a", addr)]).await;

    let params = ChatParams {
        message: "hello".to_string(),
        idempotency_key: Some("same-key".to_string()),
        ..ChatParams::default()
    };

    let first = tokio::spawn({
        let router = router.clone();
        let idempotency = idempotency.clone();
        let params = params.clone();
        async move {
            modelhub_gateway::endpoints::chat::chat_completions(router, idempotency, params).await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second =
        modelhub_gateway::endpoints::chat::chat_completions(router, idempotency, params).await;

    assert!(matches!(second, Err(Error::DuplicateRequest { .. })));
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), 200);
    let lines = body_to_lines(first).await;
    assert_eq!(lines.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn test_upstream_error_opens_circuit_after_three_requests() {
    // An upstream that always refuses
    let app = axum::Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Response::builder()
                .status(500)
                .body(Body::from("boom"))
                .unwrap()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (router, idempotency) = gateway_for(vec![upstream_instance("a", addr)]).await;
    for _ in 0..3 {
        let params = ChatParams {
            message: "hello".to_string(),
            ..ChatParams::default()
        };
        let result = modelhub_gateway::endpoints::chat::chat_completions(
            router.clone(),
            idempotency.clone(),
            params,
        )
        .await;
        assert!(matches!(result, Err(Error::DownstreamServer { .. })));
    }

    // Three consecutive failures open the circuit; the instance leaves the
    // healthy set and admission fails
    let params = ChatParams {
        message: "hello".to_string(),
        ..ChatParams::default()
    };
    let result =
        modelhub_gateway::endpoints::chat::chat_completions(router.clone(), idempotency, params)
            .await;
    assert!(matches!(result, Err(Error::NoInstanceAvailable)));
    assert_eq!(router.statuses()[0].stats.healthy_count, 0);
}

#[tokio::test]
async fn test_multiline_and_prefixless_chunks() {
    let addr = spawn_upstream(
        "{\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\ndata: data: {\"choices\":[{\"index\":1,\"delta\":{\"content\":\"b\"}}]}\nevent: ping\ndata: [DONE]\n",
        Duration::ZERO,
    )
    .await;
    let (router, idempotency) = gateway_for(vec![upstream_instance("a", addr)]).await;

    let params = ChatParams {
        message: "hello".to_string(),
        ..ChatParams::default()
    };
    let response = modelhub_gateway::endpoints::chat::chat_completions(router, idempotency, params)
        .await
        .unwrap();
    let lines = body_to_lines(response).await;
    assert_eq!(lines.len(), 3);
    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], json!("a"));
    assert_eq!(second["choices"][0]["delta"]["content"], json!("b"));
    assert_eq!(lines[2], "[DONE]");
}
