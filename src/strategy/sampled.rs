use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::instance::{InstanceHandle, InstanceSnapshot};
use crate::settings::{Algorithm, Settings};

use super::{
    snapshot_metrics_for, stats_for, AcquireOutcome, AdmissionCounters, InstanceSet, SettingsCell,
    Strategy, StrategyStats,
};

/// Power-of-K admission: each round samples K distinct instances uniformly,
/// shuffles them, and admits on the first budget gate that accepts.
#[derive(Debug)]
pub struct SampledStrategy {
    set: InstanceSet,
    settings: SettingsCell,
    counters: AdmissionCounters,
    active: AtomicBool,
}

impl SampledStrategy {
    pub fn new(settings: Settings) -> Self {
        SampledStrategy {
            set: InstanceSet::default(),
            settings: SettingsCell::new(settings),
            counters: AdmissionCounters::default(),
            active: AtomicBool::new(false),
        }
    }
}

impl Strategy for SampledStrategy {
    fn on_activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    fn on_deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.set.clear();
    }

    fn on_settings_changed(&self, settings: &Settings) {
        self.settings.replace(settings.clone());
    }

    fn refresh_instances(&self, instances: Vec<Arc<InstanceHandle>>) {
        self.set.replace(instances);
    }

    fn acquire(&self, tokens: u32, bucket_index: usize) -> AcquireOutcome {
        let settings = self.settings.load();
        let instances = self.set.load();
        let rounds = settings.sample_rounds.max(1);

        let mut rng = rand::thread_rng();
        let mut saw_candidates = false;
        for _ in 0..rounds {
            let k = (settings.sample_count as usize).min(instances.len());
            if k == 0 {
                break;
            }
            saw_candidates = true;

            let sample = rand::seq::index::sample(&mut rng, instances.len(), k);
            let mut candidates: Vec<&Arc<InstanceHandle>> =
                sample.iter().map(|i| &instances[i]).collect();
            // Shuffle to avoid bias when several candidates would admit
            candidates.shuffle(&mut rng);

            for candidate in candidates {
                if candidate.try_acquire(tokens) {
                    self.counters.record(bucket_index);
                    return AcquireOutcome::Admitted(candidate.clone());
                }
            }
        }

        if saw_candidates {
            AcquireOutcome::RejectedBudget
        } else {
            AcquireOutcome::RejectedSampling
        }
    }

    fn snapshot_metrics(&self) -> HashMap<String, InstanceSnapshot> {
        snapshot_metrics_for(&self.set)
    }

    fn get_stats(&self) -> StrategyStats {
        stats_for(
            Algorithm::Sampled,
            &self.set,
            &self.counters,
            &self.settings.load(),
        )
    }
}
