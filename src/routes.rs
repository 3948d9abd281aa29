use axum::routing::{get, post};
use axum::Router;

use crate::endpoints;
use crate::gateway_util::AppStateData;

/// Compose the full gateway route table over the shared app state.
pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(endpoints::chat::chat_completions_handler),
        )
        .route(
            "/admin/settings",
            get(endpoints::admin::get_settings_handler)
                .put(endpoints::admin::put_settings_handler),
        )
        .route(
            "/admin/strategies",
            get(endpoints::admin::strategy_status_handler),
        )
        .route(
            "/admin/instances/refresh",
            post(endpoints::admin::refresh_instances_handler),
        )
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .with_state(app_state)
}
