use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::budget::InstanceBudget;
use crate::error::Error;
use crate::gateway_util::now_ms;

pub const DEFAULT_RPM: u32 = 600;
pub const DEFAULT_TPM: u64 = 600_000;

/// Consecutive failures before the circuit opens
const CIRCUIT_OPEN_THRESHOLD: u32 = 3;

/// Dotted paths into the downstream response objects.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct ResponsePaths {
    pub request_id: String,
    pub content: String,
    pub sequence: String,
}

impl Default for ResponsePaths {
    fn default() -> Self {
        ResponsePaths {
            request_id: "id".to_string(),
            content: "choices.0.delta.content".to_string(),
            sequence: "choices.0.index".to_string(),
        }
    }
}

/// A configured backend endpoint of one model at one provider.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelInstance {
    pub id: String,
    /// Provider tag. Only the `azure` tag changes behavior (an extra
    /// `api-key` header on outbound requests).
    pub provider: String,
    pub model_name: String,
    pub url: Url,
    pub api_key: SecretString,
    /// JSON template with placeholder tokens; empty means the minimal
    /// default payload is used
    #[serde(default)]
    pub request_template: String,
    #[serde(default)]
    pub response_paths: ResponsePaths,
    /// Emit downstream objects untransformed
    #[serde(default)]
    pub raw_passthrough: bool,
    #[serde(default)]
    pub rpm_limit: u32,
    #[serde(default)]
    pub tpm_limit: u32,
    /// Legacy per-instance request limit consulted when `rpm_limit` is unset
    #[serde(default)]
    pub fallback_rpm: Option<u32>,
    /// Empty resolves to "default"
    #[serde(default)]
    pub pool_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ModelInstance {
    pub fn effective_rpm(&self) -> u32 {
        if self.rpm_limit > 0 {
            return self.rpm_limit;
        }
        match self.fallback_rpm {
            Some(fallback) if fallback > 0 => fallback,
            _ => DEFAULT_RPM,
        }
    }

    pub fn effective_tpm(&self) -> u64 {
        if self.tpm_limit > 0 {
            self.tpm_limit as u64
        } else {
            DEFAULT_TPM
        }
    }

    pub fn effective_pool_key(&self) -> &str {
        if self.pool_key.is_empty() {
            "default"
        } else {
            &self.pool_key
        }
    }

    /// Identity used for deduplication when loading the instance list
    fn dedup_key(&self) -> (String, String, String, String) {
        (
            self.provider.clone(),
            self.model_name.clone(),
            self.url.to_string(),
            self.api_key.expose_secret().clone(),
        )
    }
}

/// Transient per-instance runtime counters. These live beside the
/// configuration record rather than in it, so a config reload replaces the
/// record while the counters travel via snapshot/restore.
#[derive(Debug, Default)]
pub struct InstanceRuntime {
    pub request_count: AtomicU64,
    pub failure_count: AtomicU32,
    pub total_latency_ms: AtomicU64,
    pub last_used_ms: AtomicI64,
    pub last_failure_ms: AtomicI64,
    pub last_heartbeat_ms: AtomicI64,
    circuit_open: AtomicBool,
    pub inflight: AtomicU32,
}

/// Snapshot of the runtime counters, keyed by instance id across refreshes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceSnapshot {
    pub request_count: u64,
    pub failure_count: u32,
    pub total_latency_ms: u64,
    pub last_used_ms: i64,
    pub last_failure_ms: i64,
    pub last_heartbeat_ms: i64,
    pub circuit_open: bool,
}

/// A configured instance plus its runtime state and admission budget. The
/// strategy runtime that owns the handle shares it with in-flight requests
/// via `Arc`.
#[derive(Debug)]
pub struct InstanceHandle {
    pub config: ModelInstance,
    pub runtime: InstanceRuntime,
    pub budget: InstanceBudget,
}

impl InstanceHandle {
    pub fn new(config: ModelInstance) -> Self {
        InstanceHandle {
            config,
            runtime: InstanceRuntime::default(),
            budget: InstanceBudget::default(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.config.active && !self.runtime.circuit_open.load(Ordering::Acquire)
    }

    /// Budget admission for one request; unhealthy instances admit nothing.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        if !self.is_healthy() {
            return false;
        }
        self.budget.try_acquire(
            tokens,
            self.config.effective_rpm(),
            self.config.effective_tpm(),
        )
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.runtime.failure_count.store(0, Ordering::Release);
        self.runtime.circuit_open.store(false, Ordering::Release);
        self.runtime.request_count.fetch_add(1, Ordering::AcqRel);
        self.runtime
            .total_latency_ms
            .fetch_add(latency_ms, Ordering::AcqRel);
        self.runtime.last_used_ms.store(now_ms(), Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.runtime.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= CIRCUIT_OPEN_THRESHOLD {
            self.runtime.circuit_open.store(true, Ordering::Release);
        }
        self.runtime
            .last_failure_ms
            .store(now_ms(), Ordering::Release);
    }

    /// Best-effort read of the runtime counters; the composite is not
    /// guaranteed to be a single consistent observation.
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            request_count: self.runtime.request_count.load(Ordering::Acquire),
            failure_count: self.runtime.failure_count.load(Ordering::Acquire),
            total_latency_ms: self.runtime.total_latency_ms.load(Ordering::Acquire),
            last_used_ms: self.runtime.last_used_ms.load(Ordering::Acquire),
            last_failure_ms: self.runtime.last_failure_ms.load(Ordering::Acquire),
            last_heartbeat_ms: self.runtime.last_heartbeat_ms.load(Ordering::Acquire),
            circuit_open: self.runtime.circuit_open.load(Ordering::Acquire),
        }
    }

    pub fn restore(&self, snapshot: &InstanceSnapshot) {
        self.runtime
            .request_count
            .store(snapshot.request_count, Ordering::Release);
        self.runtime
            .failure_count
            .store(snapshot.failure_count, Ordering::Release);
        self.runtime
            .total_latency_ms
            .store(snapshot.total_latency_ms, Ordering::Release);
        self.runtime
            .last_used_ms
            .store(snapshot.last_used_ms, Ordering::Release);
        self.runtime
            .last_failure_ms
            .store(snapshot.last_failure_ms, Ordering::Release);
        self.runtime
            .last_heartbeat_ms
            .store(snapshot.last_heartbeat_ms, Ordering::Release);
        self.runtime
            .circuit_open
            .store(snapshot.circuit_open, Ordering::Release);
    }
}

/// Source of the configured instance list. The list may be reloaded at any
/// time; the router preserves runtime counters across reloads.
#[derive(Debug)]
pub enum InstanceStore {
    /// Fixed in-memory list (tests and embedded use)
    Static { instances: Mutex<Vec<ModelInstance>> },
    /// JSON document on disk
    File { path: PathBuf },
}

impl InstanceStore {
    pub fn new_static(instances: Vec<ModelInstance>) -> Self {
        InstanceStore::Static {
            instances: Mutex::new(instances),
        }
    }

    pub fn new_file(path: PathBuf) -> Self {
        InstanceStore::File { path }
    }

    /// Replace the static list (no-op for the file backend)
    pub fn set_instances(&self, new_instances: Vec<ModelInstance>) {
        if let InstanceStore::Static { instances } = self {
            let mut guard = match instances.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = new_instances;
        }
    }

    pub async fn load(&self) -> Result<Vec<ModelInstance>, Error> {
        let instances = match self {
            InstanceStore::Static { instances } => {
                let guard = match instances.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.clone()
            }
            InstanceStore::File { path } => {
                let contents =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|e| Error::InstanceStore {
                            message: format!(
                                "Failed to read instance store `{}`: {e}",
                                path.display()
                            ),
                        })?;
                serde_json::from_str::<Vec<ModelInstance>>(&contents).map_err(|e| {
                    Error::InstanceStore {
                        message: format!(
                            "Failed to parse instance store `{}`: {e}",
                            path.display()
                        ),
                    }
                })?
            }
        };
        Ok(dedup_instances(instances))
    }
}

/// Instance uniqueness is by (provider, model, url, api key); duplicates keep
/// the first occurrence.
fn dedup_instances(instances: Vec<ModelInstance>) -> Vec<ModelInstance> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(instances.len());
    for instance in instances {
        if seen.insert(instance.dedup_key()) {
            out.push(instance);
        } else {
            tracing::warn!(
                "Dropping duplicate instance `{}` ({} / {})",
                instance.id,
                instance.provider,
                instance.model_name
            );
        }
    }
    out
}

/// Build the snapshot map for a set of handles.
pub fn snapshot_all<'a>(
    handles: impl Iterator<Item = &'a std::sync::Arc<InstanceHandle>>,
) -> HashMap<String, InstanceSnapshot> {
    handles
        .map(|handle| (handle.config.id.clone(), handle.snapshot()))
        .collect()
}
