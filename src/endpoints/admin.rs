use axum::debug_handler;
use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::error::{Error, ResultExt};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::router::RuntimeStatus;
use crate::settings::Settings;

/// Current settings snapshot
#[debug_handler(state = AppStateData)]
pub async fn get_settings_handler(State(AppStateData { router, .. }): AppState) -> Json<Settings> {
    Json((*router.settings()).clone())
}

/// Replace the settings. Values are clamped on ingestion; a change to the
/// algorithm or the pool ordering hot-swaps the strategy runtimes. The
/// applied (normalized) snapshot is returned and persisted best-effort.
#[debug_handler(state = AppStateData)]
pub async fn put_settings_handler(
    State(AppStateData { config, router, .. }): AppState,
    StructuredJson(new_settings): StructuredJson<Settings>,
) -> Result<Json<Settings>, Error> {
    router.update_settings(new_settings).await?;
    let applied = (*router.settings()).clone();
    applied.save(config.stores.settings.as_deref()).ok_or_log();
    Ok(Json(applied))
}

/// One status entry per live strategy runtime
#[debug_handler(state = AppStateData)]
pub async fn strategy_status_handler(
    State(AppStateData { router, .. }): AppState,
) -> Json<Vec<RuntimeStatus>> {
    Json(router.statuses())
}

/// Reload the instance list from the store
#[debug_handler(state = AppStateData)]
pub async fn refresh_instances_handler(
    State(AppStateData { router, .. }): AppState,
) -> Result<Json<serde_json::Value>, Error> {
    router.refresh().await?;
    Ok(Json(json!({"status": "ok"})))
}
