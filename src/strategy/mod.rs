use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::instance::{snapshot_all, InstanceHandle, InstanceSnapshot};
use crate::settings::{Algorithm, Settings};

pub mod sampled;
pub mod scored;

/// Upper bound on configurable bucket counts; sized for the per-bucket
/// admission counters.
pub const MAX_BUCKETS: usize = 8;

/// Result of one admission attempt inside a strategy. Strategies never
/// surface errors; a failed attempt is classified instead.
#[derive(Debug)]
pub enum AcquireOutcome {
    Admitted(Arc<InstanceHandle>),
    /// Candidates existed but every budget gate refused
    RejectedBudget,
    /// Sampling produced no candidates at all
    RejectedSampling,
}

/// Aggregate view of a strategy, for the admin status surface.
#[derive(Clone, Debug, Serialize)]
pub struct StrategyStats {
    pub algorithm: Algorithm,
    pub instance_count: usize,
    pub healthy_count: usize,
    pub admitted_total: u64,
    pub admitted_by_bucket: Vec<u64>,
    /// Advisory release horizon; tuning hint only, never enforced
    pub advisory_release_sec: u32,
}

/// A load-balancing strategy bound to one pool.
pub trait Strategy: Send + Sync {
    fn on_activate(&self);
    fn on_deactivate(&self);
    fn on_settings_changed(&self, settings: &Settings);
    fn refresh_instances(&self, instances: Vec<Arc<InstanceHandle>>);
    fn acquire(&self, tokens: u32, bucket_index: usize) -> AcquireOutcome;
    fn snapshot_metrics(&self) -> HashMap<String, InstanceSnapshot>;
    fn get_stats(&self) -> StrategyStats;
}

pub fn build_strategy(algorithm: Algorithm, settings: &Settings) -> Box<dyn Strategy> {
    match algorithm {
        Algorithm::Sampled => Box::new(sampled::SampledStrategy::new(settings.clone())),
        Algorithm::Scored => Box::new(scored::ScoredStrategy::new(settings.clone())),
    }
}

/// Instance list shared between refresh and acquire paths. Acquire takes a
/// cheap `Arc` snapshot so refresh never blocks admissions.
#[derive(Debug, Default)]
pub(crate) struct InstanceSet {
    instances: RwLock<Arc<Vec<Arc<InstanceHandle>>>>,
}

impl InstanceSet {
    pub fn replace(&self, instances: Vec<Arc<InstanceHandle>>) {
        let mut guard = match self.instances.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(instances);
    }

    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    pub fn load(&self) -> Arc<Vec<Arc<InstanceHandle>>> {
        let guard = match self.instances.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }
}

/// Admission counters shared by the concrete strategies.
#[derive(Debug, Default)]
pub(crate) struct AdmissionCounters {
    total: AtomicU64,
    by_bucket: [AtomicU64; MAX_BUCKETS],
}

impl AdmissionCounters {
    pub fn record(&self, bucket_index: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.by_bucket.get(bucket_index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn by_bucket(&self) -> Vec<u64> {
        self.by_bucket
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

/// Settings snapshot holder; replaced wholesale on settings changes.
#[derive(Debug)]
pub(crate) struct SettingsCell {
    settings: RwLock<Arc<Settings>>,
}

impl SettingsCell {
    pub fn new(settings: Settings) -> Self {
        SettingsCell {
            settings: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn replace(&self, settings: Settings) {
        let mut guard = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(settings);
    }

    pub fn load(&self) -> Arc<Settings> {
        let guard = match self.settings.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }
}

/// Tuning hint derived from the advisory pressure band: a loaded pool halves
/// the suggested release horizon, an idle one doubles it.
pub(crate) fn advisory_release_sec(settings: &Settings, mean_pressure: f64) -> u32 {
    let base = settings.instance_release_sec;
    if mean_pressure >= settings.pressure_high {
        (base / 2).max(1)
    } else if mean_pressure <= settings.pressure_low {
        base.saturating_mul(2).min(3_600)
    } else {
        base
    }
}

/// Composite pressure of one instance in [0, 1]: concurrency dominates, the
/// two budget headrooms split the remainder.
pub(crate) fn pressure(handle: &InstanceHandle) -> f64 {
    let inflight = handle.runtime.inflight.load(Ordering::Acquire) as f64;
    let concurrency = inflight / (inflight + 8.0);

    let effective_rpm = handle.config.effective_rpm();
    let rpm_headroom = if effective_rpm > 0 {
        handle.budget.available_rpm(effective_rpm) as f64 / effective_rpm as f64
    } else {
        1.0
    };

    let effective_tpm = handle.config.effective_tpm();
    let tpm_headroom = if effective_tpm > 0 {
        handle.budget.available_tpm(effective_tpm) as f64 / effective_tpm as f64
    } else {
        1.0
    };

    concurrency * 0.60 + (1.0 - rpm_headroom) * 0.20 + (1.0 - tpm_headroom) * 0.20
}

pub(crate) fn stats_for(
    algorithm: Algorithm,
    set: &InstanceSet,
    counters: &AdmissionCounters,
    settings: &Settings,
) -> StrategyStats {
    let instances = set.load();
    let healthy_count = instances.iter().filter(|h| h.is_healthy()).count();
    let mean_pressure = if instances.is_empty() {
        0.0
    } else {
        instances.iter().map(|h| pressure(h)).sum::<f64>() / instances.len() as f64
    };
    StrategyStats {
        algorithm,
        instance_count: instances.len(),
        healthy_count,
        admitted_total: counters.total(),
        admitted_by_bucket: counters.by_bucket(),
        advisory_release_sec: advisory_release_sec(settings, mean_pressure),
    }
}

pub(crate) fn snapshot_metrics_for(set: &InstanceSet) -> HashMap<String, InstanceSnapshot> {
    let instances = set.load();
    snapshot_all(instances.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ModelInstance;

    pub(crate) fn handle(id: &str, rpm: u32, tpm: u32) -> Arc<InstanceHandle> {
        let instance: ModelInstance = serde_json::from_value(serde_json::json!({
            "id": id,
            "provider": "openai",
            "model_name": "gpt-4o-mini",
            "url": "http://localhost:9001/v1/chat/completions",
            "api_key": "sk-test",
            "rpm_limit": rpm,
            "tpm_limit": tpm,
        }))
        .unwrap();
        Arc::new(InstanceHandle::new(instance))
    }

    #[test]
    fn test_instance_set_snapshot_isolation() {
        let set = InstanceSet::default();
        set.replace(vec![handle("a", 10, 0)]);
        let snapshot = set.load();
        set.replace(vec![handle("b", 10, 0), handle("c", 10, 0)]);
        // The earlier snapshot still sees the old list
        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.load().len(), 2);
    }

    #[test]
    fn test_pressure_rises_with_inflight() {
        let h = handle("a", 100, 100_000);
        let idle = pressure(&h);
        h.runtime.inflight.store(32, Ordering::Release);
        let busy = pressure(&h);
        assert!(busy > idle);
        assert!(busy <= 1.0);
    }

    #[test]
    fn test_advisory_release_band() {
        let settings = Settings::default();
        assert_eq!(advisory_release_sec(&settings, 0.0), 120);
        assert_eq!(advisory_release_sec(&settings, 0.5), 60);
        assert_eq!(advisory_release_sec(&settings, 0.9), 30);
    }

    #[test]
    fn test_admission_counters_ignore_out_of_range_bucket() {
        let counters = AdmissionCounters::default();
        counters.record(2);
        counters.record(MAX_BUCKETS + 5);
        assert_eq!(counters.total(), 2);
        assert_eq!(counters.by_bucket()[2], 1);
    }
}
