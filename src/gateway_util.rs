use axum::body::Bytes;
use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::instrument;

use crate::client::ClientManager;
use crate::config::{Config, IdempotencyMode};
use crate::error::Error;
use crate::idempotency::IdempotencyStore;
use crate::instance::InstanceStore;
use crate::router::Router;
use crate::settings::Settings;

/// Millisecond wall clock. All runtime timestamps in the gateway use this
/// single helper so tests can reason about one time base.
pub fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(_) => 0,
    }
}

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub router: Arc<Router>,
    pub idempotency: Arc<IdempotencyStore>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let store = match &config.stores.instances {
            Some(path) => InstanceStore::new_file(path.clone()),
            None => {
                tracing::warn!(
                    "No instance store configured; the gateway will accept zero requests until instances are provided"
                );
                InstanceStore::new_static(Vec::new())
            }
        };

        let settings = Settings::load_or_default(config.stores.settings.as_deref()).clamped();
        let clients = Arc::new(ClientManager::new());
        let router = Router::new(settings, store, clients).await?;

        let idempotency = match config.idempotency.mode {
            IdempotencyMode::Memory => IdempotencyStore::new_memory(),
            IdempotencyMode::Disabled => IdempotencyStore::new_disabled(),
        };

        Ok(Self {
            config,
            router: Arc::new(router),
            idempotency: Arc::new(idempotency),
        })
    }
}

/// JSON body extractor for the chat and admin endpoints. Failures surface as
/// `Error::JsonRequest` (HTTP 400) with the offending field path, and the
/// `Content-Type` header is ignored; every body on these routes is JSON.
pub struct StructuredJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| Error::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })?;

        // Go through a generic value so the typed deserialization below can
        // name the path that failed, not just the expected type
        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| Error::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })?
            .0;
        let parsed: T =
            serde_path_to_error::deserialize(&value).map_err(|e| Error::JsonRequest {
                message: e.to_string(),
            })?;

        Ok(StructuredJson(parsed))
    }
}
