use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Error;

/// Load-balancing algorithm selector.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Power-of-K sampling with shuffled budget attempts.
    #[default]
    Sampled,
    /// Sampling followed by pressure-score ordering.
    Scored,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let serialized = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", serialized.trim_matches('"'))
    }
}

/// Runtime-tunable settings snapshot.
///
/// Every numeric field is clamped on ingestion (`clamped`); the struct held
/// by the router is always normalized. Persisted best-effort as a single
/// JSON document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    pub algorithm: Algorithm,
    /// Instances sampled per round (K)
    pub sample_count: u32,
    /// Sampling rounds per acquire (R)
    pub sample_rounds: u32,
    /// Budget attempts per round for the scored algorithm
    pub round_batch_size: u32,
    pub bucket_count: u32,
    /// CSV of bucket upper bounds; invalid or mismatched input falls back to
    /// generated defaults
    pub bucket_ranges: String,
    /// CSV of bucket weights, parallel to `bucket_ranges`
    pub bucket_weights: String,
    /// Largest supported context size in KiB-of-tokens, drives default
    /// bucket boundaries
    pub max_context_k: u32,
    pub histogram_sample_size: u32,
    pub boundary_refresh_min_sec: u32,
    pub boundary_refresh_max_sec: u32,
    pub dynamic_bucketing: bool,
    /// CSV of pool keys in the order the router consults them
    pub pool_keys: String,
    /// Bound on concurrent in-flight requests per pool
    pub queue_capacity: u32,
    /// Advisory release horizon in seconds; surfaced in stats, never
    /// consulted on the acquire path
    pub instance_release_sec: u32,
    /// Advisory pressure band for the tuning hints in strategy stats
    pub pressure_low: f64,
    pub pressure_high: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            algorithm: Algorithm::Sampled,
            sample_count: 2,
            sample_rounds: 3,
            round_batch_size: 4,
            bucket_count: 5,
            bucket_ranges: String::new(),
            bucket_weights: String::new(),
            max_context_k: 128,
            histogram_sample_size: 600,
            boundary_refresh_min_sec: 30,
            boundary_refresh_max_sec: 300,
            dynamic_bucketing: true,
            pool_keys: "default".to_string(),
            queue_capacity: 256,
            instance_release_sec: 60,
            pressure_low: 0.3,
            pressure_high: 0.8,
        }
    }
}

impl Settings {
    pub fn set_sample_count(&mut self, value: u32) {
        self.sample_count = value.clamp(1, 16);
    }

    pub fn set_sample_rounds(&mut self, value: u32) {
        self.sample_rounds = value.clamp(1, 8);
    }

    pub fn set_round_batch_size(&mut self, value: u32) {
        self.round_batch_size = value.clamp(1, 32);
    }

    pub fn set_bucket_count(&mut self, value: u32) {
        self.bucket_count = value.clamp(5, 6);
    }

    pub fn set_max_context_k(&mut self, value: u32) {
        self.max_context_k = value.clamp(1, 1024);
    }

    pub fn set_histogram_sample_size(&mut self, value: u32) {
        self.histogram_sample_size = value.clamp(32, 10_000);
    }

    pub fn set_boundary_refresh_sec(&mut self, min: u32, max: u32) {
        self.boundary_refresh_min_sec = min.clamp(5, 3_600);
        self.boundary_refresh_max_sec = max.clamp(self.boundary_refresh_min_sec, 7_200);
    }

    pub fn set_queue_capacity(&mut self, value: u32) {
        self.queue_capacity = value.clamp(1, 65_536);
    }

    pub fn set_instance_release_sec(&mut self, value: u32) {
        self.instance_release_sec = value.clamp(1, 3_600);
    }

    pub fn set_pressure_band(&mut self, low: f64, high: f64) {
        self.pressure_low = if low.is_finite() {
            low.clamp(0.0, 1.0)
        } else {
            0.3
        };
        self.pressure_high = if high.is_finite() {
            high.clamp(self.pressure_low, 1.0)
        } else {
            1.0f64.min(self.pressure_low.max(0.8))
        };
    }

    /// Run every clamping setter over the current values, producing a
    /// normalized snapshot. Applied on every ingestion path (startup load,
    /// admin PUT).
    pub fn clamped(mut self) -> Self {
        self.set_sample_count(self.sample_count);
        self.set_sample_rounds(self.sample_rounds);
        self.set_round_batch_size(self.round_batch_size);
        self.set_bucket_count(self.bucket_count);
        self.set_max_context_k(self.max_context_k);
        self.set_histogram_sample_size(self.histogram_sample_size);
        self.set_boundary_refresh_sec(self.boundary_refresh_min_sec, self.boundary_refresh_max_sec);
        self.set_queue_capacity(self.queue_capacity);
        self.set_instance_release_sec(self.instance_release_sec);
        self.set_pressure_band(self.pressure_low, self.pressure_high);
        if self.pool_keys.trim().is_empty() {
            self.pool_keys = "default".to_string();
        }
        self
    }

    /// Pool keys in configured order, deduplicated preserving first
    /// occurrence. Defaults to `["default"]`.
    pub fn ordered_pool_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for raw in self.pool_keys.split(',') {
            let key = raw.trim();
            if key.is_empty() {
                continue;
            }
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        if keys.is_empty() {
            keys.push("default".to_string());
        }
        keys
    }

    /// Parse the configured bucket boundaries. Returns `None` unless the CSV
    /// yields exactly `bucket_count` positive integers; the result is sorted
    /// ascending.
    pub fn parsed_bucket_ranges(&self) -> Option<Vec<u32>> {
        let mut ranges = parse_positive_csv(&self.bucket_ranges)?;
        if ranges.len() != self.bucket_count as usize {
            return None;
        }
        ranges.sort_unstable();
        Some(ranges)
    }

    /// Parse the configured bucket weights (each at least 1); `None` unless
    /// the count matches `bucket_count`.
    pub fn parsed_bucket_weights(&self) -> Option<Vec<u32>> {
        let weights = parse_positive_csv(&self.bucket_weights)?;
        if weights.len() != self.bucket_count as usize {
            return None;
        }
        Some(weights)
    }

    /// Load the persisted settings document, falling back to defaults when
    /// the path is unset, missing, or unreadable.
    pub fn load_or_default(path: Option<&Path>) -> Settings {
        let Some(path) = path else {
            return Settings::default();
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::info!(
                    "No persisted settings at `{}` ({e}); using defaults",
                    path.display()
                );
                return Settings::default();
            }
        };
        match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings.clamped(),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse persisted settings at `{}`: {e}; using defaults",
                    path.display()
                );
                Settings::default()
            }
        }
    }

    /// Persist the settings document. Best-effort; callers log and continue
    /// on failure.
    pub fn save(&self, path: Option<&Path>) -> Result<(), Error> {
        let Some(path) = path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(self).map_err(|e| Error::Serialization {
            message: format!("Failed to serialize settings: {e}"),
        })?;
        std::fs::write(path, contents).map_err(|e| Error::Settings {
            message: format!("Failed to write settings to `{}`: {e}", path.display()),
        })
    }
}

fn parse_positive_csv(raw: &str) -> Option<Vec<u32>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut values = Vec::new();
    for part in trimmed.split(',') {
        let value: u32 = part.trim().parse().ok()?;
        if value == 0 {
            return None;
        }
        values.push(value);
    }
    Some(values)
}
