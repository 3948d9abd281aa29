use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_util::{AppState, AppStateData};

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn status_handler() -> Json<Value> {
    Json(json!({"name": "modelhub-gateway", "version": GATEWAY_VERSION}))
}

pub async fn health_handler(State(AppStateData { router, .. }): AppState) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "healthy_instances": router.has_healthy_instance(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_reports_version() {
        let Json(body) = status_handler().await;
        assert_eq!(body["name"], json!("modelhub-gateway"));
        assert_eq!(body["version"], json!(GATEWAY_VERSION));
    }
}
