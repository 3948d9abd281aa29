use dashmap::DashMap;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::instance::InstanceHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Owns one outbound HTTP client with a dedicated connection pool per
/// instance id. Pools are built lazily on first use and disposed when the
/// instance disappears from the configuration.
///
/// Lock order: `refresh` takes the global refresh lock first, then each
/// per-id lock it removes; `get` only ever takes a per-id lock.
#[derive(Debug, Default)]
pub struct ClientManager {
    clients: DashMap<String, Arc<Client>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    refresh_lock: Mutex<()>,
}

impl ClientManager {
    pub fn new() -> Self {
        ClientManager::default()
    }

    /// The pooled client for this instance, built on first use
    /// (double-checked under the per-id lock).
    pub async fn get(&self, handle: &InstanceHandle) -> Result<Arc<Client>, Error> {
        let id = &handle.config.id;
        if let Some(client) = self.clients.get(id) {
            return Ok(client.clone());
        }

        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(client) = self.clients.get(id) {
            return Ok(client.clone());
        }

        let client = Arc::new(build_client(handle.config.effective_rpm())?);
        self.clients.insert(id.clone(), client.clone());
        tracing::debug!(
            "Built connection pool for instance `{}` (max {} connections)",
            id,
            pool_size(handle.config.effective_rpm())
        );
        Ok(client)
    }

    /// Dispose the pool of every cached id that is not in `active_ids`.
    /// The per-id lock entry goes with the pool so the lock table cannot
    /// grow without bound.
    pub async fn refresh(&self, active_ids: &HashSet<String>) {
        let _refresh_guard = self.refresh_lock.lock().await;

        let stale: Vec<String> = self
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !active_ids.contains(id))
            .collect();

        for id in stale {
            let lock = self.locks.get(&id).map(|entry| entry.value().clone());
            if let Some(lock) = lock {
                let _id_guard = lock.lock().await;
                self.clients.remove(&id);
            } else {
                self.clients.remove(&id);
            }
            self.locks.remove(&id);
            tracing::info!("Disposed connection pool for departed instance `{id}`");
        }
    }

    /// Dispose every pool (process shutdown).
    pub async fn shutdown(&self) {
        self.refresh(&HashSet::new()).await;
    }

    pub fn pool_count(&self) -> usize {
        self.clients.len()
    }
}

/// Pool size derived from the effective request rate.
fn pool_size(effective_rpm: u32) -> u32 {
    (effective_rpm / 10).clamp(10, 200)
}

fn build_client(effective_rpm: u32) -> Result<Client, Error> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(pool_size(effective_rpm) as usize)
        .tcp_keepalive(TCP_KEEPALIVE)
        .build()
        .map_err(|e| Error::ClientBuild {
            message: e.to_string(),
        })
}
