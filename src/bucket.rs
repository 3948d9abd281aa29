use std::collections::VecDeque;
use std::sync::Mutex;

use crate::gateway_util::now_ms;
use crate::settings::Settings;

/// Lower floor for any bucket boundary
const MIN_BOUNDARY: u32 = 64;

/// Histogram must hold at least this many samples before boundaries adapt
const MIN_ADAPT_SAMPLES: usize = 32;

/// Classifies requests into token buckets and adapts the bucket boundaries
/// to the observed request-size distribution.
#[derive(Debug)]
pub struct BucketManager {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    boundaries: Vec<u32>,
    weights: Vec<u32>,
    histogram: VecDeque<u32>,
    last_boundary_update_ms: i64,
    /// Bucket distribution at the time of the last boundary update
    last_observed: Vec<f64>,
}

impl BucketManager {
    pub fn new(settings: &Settings) -> Self {
        let boundaries = initial_boundaries(settings);
        let weights = initial_weights(settings);
        BucketManager {
            state: Mutex::new(BucketState {
                boundaries,
                weights,
                histogram: VecDeque::new(),
                last_boundary_update_ms: 0,
                last_observed: Vec::new(),
            }),
        }
    }

    /// Re-derive boundaries and weights from a new settings snapshot. The
    /// histogram is kept; adaptation state restarts.
    pub fn apply_settings(&self, settings: &Settings) {
        let boundaries = initial_boundaries(settings);
        let weights = initial_weights(settings);
        let mut state = self.lock();
        state.boundaries = boundaries;
        state.weights = weights;
        state.last_boundary_update_ms = 0;
        state.last_observed.clear();
    }

    /// The lowest bucket whose upper bound admits `tokens`; the last bucket
    /// catches everything above the final boundary.
    pub fn resolve_bucket_index(&self, tokens: u32) -> usize {
        let state = self.lock();
        state.resolve(tokens)
    }

    /// Record a request-size observation, adapt the boundaries when due, and
    /// resolve the bucket index for this request. One critical section.
    pub fn observe(&self, tokens: u32, settings: &Settings) -> usize {
        self.observe_at(now_ms(), tokens, settings)
    }

    pub(crate) fn observe_at(&self, now: i64, tokens: u32, settings: &Settings) -> usize {
        let tokens = tokens.max(1);
        let mut state = self.lock();
        state.histogram.push_back(tokens);
        let cap = settings.histogram_sample_size as usize;
        while state.histogram.len() > cap {
            state.histogram.pop_front();
        }

        if settings.dynamic_bucketing && state.histogram.len() >= MIN_ADAPT_SAMPLES {
            state.maybe_adapt(now, settings);
        }

        state.resolve(tokens)
    }

    /// Current boundaries, for the admin status surface.
    pub fn boundaries(&self) -> Vec<u32> {
        self.lock().boundaries.clone()
    }

    /// Current weights, for the admin status surface.
    pub fn weights(&self) -> Vec<u32> {
        self.lock().weights.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BucketState {
    fn resolve(&self, tokens: u32) -> usize {
        for (i, boundary) in self.boundaries.iter().enumerate() {
            if tokens <= *boundary {
                return i;
            }
        }
        self.boundaries.len().saturating_sub(1)
    }

    fn maybe_adapt(&mut self, now: i64, settings: &Settings) {
        let observed = self.distribution();
        let target = normalized(&self.weights);
        let distance_to_target = l1_half_distance(&observed, &target);
        let shift = if self.last_observed.len() == observed.len() {
            l1_half_distance(&observed, &self.last_observed)
        } else {
            1.0
        };
        let score = ((distance_to_target + shift) / 2.0).clamp(0.0, 1.0);

        let min_sec = settings.boundary_refresh_min_sec as f64;
        let max_sec = settings.boundary_refresh_max_sec as f64;
        let interval_ms = ((max_sec - score * (max_sec - min_sec)) * 1_000.0) as i64;
        if now - self.last_boundary_update_ms < interval_ms {
            return;
        }

        let mut sorted: Vec<u32> = self.histogram.iter().copied().collect();
        sorted.sort_unstable();
        let n = sorted.len();
        let count = self.boundaries.len();

        let mut new_boundaries = Vec::with_capacity(count);
        let mut prev: u32 = 0;
        for i in 1..=count {
            let idx = (n - 1) * i / count;
            let mut boundary = sorted[idx];
            boundary = boundary.max(prev.saturating_add(1)).max(MIN_BOUNDARY);
            new_boundaries.push(boundary);
            prev = boundary;
        }

        tracing::debug!(
            "Adapting bucket boundaries {:?} -> {:?} (score {:.3})",
            self.boundaries,
            new_boundaries,
            score
        );

        self.boundaries = new_boundaries;
        self.weights = settings
            .parsed_bucket_weights()
            .filter(|weights| weights.len() == self.boundaries.len())
            .unwrap_or_else(|| default_weights(self.boundaries.len()));
        self.last_observed = self.distribution();
        self.last_boundary_update_ms = now;
    }

    /// Share of histogram samples per bucket under the current boundaries
    fn distribution(&self) -> Vec<f64> {
        let mut counts = vec![0usize; self.boundaries.len()];
        for sample in &self.histogram {
            let idx = self.resolve(*sample);
            counts[idx] += 1;
        }
        let total = self.histogram.len().max(1) as f64;
        counts.iter().map(|c| *c as f64 / total).collect()
    }
}

fn normalized(weights: &[u32]) -> Vec<f64> {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    let total = total.max(1) as f64;
    weights.iter().map(|w| *w as f64 / total).collect()
}

/// Half the L1 distance between two distributions, in [0, 1]
fn l1_half_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .sum::<f64>()
        / 2.0
}

fn initial_boundaries(settings: &Settings) -> Vec<u32> {
    match settings.parsed_bucket_ranges() {
        Some(ranges) => strictly_increasing(ranges),
        None => default_boundaries(settings.bucket_count as usize, settings.max_context_k),
    }
}

fn initial_weights(settings: &Settings) -> Vec<u32> {
    settings
        .parsed_bucket_weights()
        .unwrap_or_else(|| default_weights(settings.bucket_count as usize))
}

fn strictly_increasing(mut ranges: Vec<u32>) -> Vec<u32> {
    let mut prev: u32 = 0;
    for boundary in ranges.iter_mut() {
        *boundary = (*boundary).max(prev.saturating_add(1)).max(MIN_BOUNDARY);
        prev = *boundary;
    }
    ranges
}

/// Spread the maximum context linearly across the buckets, floored at the
/// minimum boundary.
fn default_boundaries(count: usize, max_context_k: u32) -> Vec<u32> {
    let max_tokens = (max_context_k as u64) * 1024;
    let mut boundaries = Vec::with_capacity(count);
    let mut prev: u32 = 0;
    for i in 1..=count {
        let spread = (max_tokens * i as u64 / count as u64).min(u32::MAX as u64) as u32;
        let boundary = spread.max(MIN_BOUNDARY).max(prev.saturating_add(1));
        boundaries.push(boundary);
        prev = boundary;
    }
    boundaries
}

/// Monotone-decreasing weights summing to 100.
fn default_weights(count: usize) -> Vec<u32> {
    let denominator = (count * (count + 1) / 2) as u32;
    let mut weights: Vec<u32> = (0..count)
        .map(|i| 100 * (count - i) as u32 / denominator)
        .collect();
    let mut remainder = 100u32.saturating_sub(weights.iter().sum());
    for weight in weights.iter_mut() {
        if remainder == 0 {
            break;
        }
        *weight += 1;
        remainder -= 1;
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(count: u32, ranges: &str) -> Settings {
        Settings {
            bucket_count: count,
            bucket_ranges: ranges.to_string(),
            ..Settings::default()
        }
        .clamped()
    }

    #[test]
    fn test_default_boundaries_spread() {
        let boundaries = default_boundaries(5, 128);
        assert_eq!(boundaries.len(), 5);
        assert_eq!(boundaries[4], 128 * 1024);
        for pair in boundaries.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // Tiny contexts still respect the floor
        let tiny = default_boundaries(5, 1);
        assert!(tiny.iter().all(|b| *b >= MIN_BOUNDARY));
    }

    #[test]
    fn test_default_weights_sum_and_monotonic() {
        for count in [5usize, 6] {
            let weights = default_weights(count);
            assert_eq!(weights.iter().sum::<u32>(), 100);
            for pair in weights.windows(2) {
                assert!(pair[0] >= pair[1]);
            }
            assert!(weights.iter().all(|w| *w >= 1));
        }
    }

    #[test]
    fn test_resolve_bucket_monotonicity() {
        let settings = settings_with(5, "256,512,1024,4096,8192");
        let manager = BucketManager::new(&settings);
        let mut last = 0;
        for tokens in [1u32, 100, 256, 257, 512, 2048, 8192, 100_000] {
            let index = manager.resolve_bucket_index(tokens);
            assert!(index >= last, "index regressed at {tokens}");
            last = index;
        }
        assert_eq!(manager.resolve_bucket_index(256), 0);
        assert_eq!(manager.resolve_bucket_index(257), 1);
        assert_eq!(manager.resolve_bucket_index(100_000), 4);
    }

    #[test]
    fn test_no_adaptation_below_sample_floor() {
        let settings = settings_with(5, "256,512,1024,4096,8192");
        let manager = BucketManager::new(&settings);
        for i in 0..(MIN_ADAPT_SAMPLES - 1) {
            manager.observe_at(1_000_000 + i as i64, 5_000, &settings);
        }
        assert_eq!(manager.boundaries(), vec![256, 512, 1024, 4096, 8192]);
    }

    #[test]
    fn test_no_adaptation_when_disabled() {
        let mut settings = settings_with(5, "256,512,1024,4096,8192");
        settings.dynamic_bucketing = false;
        let manager = BucketManager::new(&settings);
        for i in 0..200 {
            manager.observe_at(1_000_000 + i as i64, 5_000, &settings);
        }
        assert_eq!(manager.boundaries(), vec![256, 512, 1024, 4096, 8192]);
    }

    #[test]
    fn test_bimodal_adaptation_places_boundary_between_modes() {
        let settings = settings_with(5, "");
        let manager = BucketManager::new(&settings);
        let mut now = 1_000_000i64;
        // 32 samples alternating between the two modes, then enough time for
        // one refresh
        for i in 0..MIN_ADAPT_SAMPLES {
            let tokens = if i % 2 == 0 { 200 } else { 5_000 };
            manager.observe_at(now, tokens, &settings);
            now += 1;
        }
        now += (settings.boundary_refresh_max_sec as i64) * 1_000 + 1;
        manager.observe_at(now, 200, &settings);

        let boundaries = manager.boundaries();
        assert!(
            boundaries[1] > 200 && boundaries[1] < 5_000,
            "expected second boundary between the modes, got {boundaries:?}"
        );
        for pair in boundaries.windows(2) {
            assert!(pair[0] < pair[1], "boundaries not strictly increasing: {boundaries:?}");
        }
    }

    #[test]
    fn test_stationary_distribution_updates_at_most_once_per_interval() {
        let settings = settings_with(5, "");
        let manager = BucketManager::new(&settings);
        let mut now = 1_000_000i64;
        for i in 0..64 {
            let tokens = if i % 2 == 0 { 200 } else { 5_000 };
            manager.observe_at(now, tokens, &settings);
            now += 1;
        }
        // Force the first update
        now += (settings.boundary_refresh_max_sec as i64) * 1_000 + 1;
        manager.observe_at(now, 200, &settings);
        let after_first = manager.boundaries();

        // Stationary feed within the minimum interval: no further update
        for i in 0..64 {
            let tokens = if i % 2 == 0 { 200 } else { 5_000 };
            manager.observe_at(now + 1 + i, tokens, &settings);
        }
        assert_eq!(manager.boundaries(), after_first);
    }

    #[test]
    fn test_histogram_bounded() {
        let mut settings = settings_with(5, "256,512,1024,4096,8192");
        settings.dynamic_bucketing = false;
        settings.histogram_sample_size = 32;
        let manager = BucketManager::new(&settings);
        for i in 0..1_000 {
            manager.observe_at(1_000_000 + i, 100, &settings);
        }
        assert!(manager.lock().histogram.len() <= 32);
    }

    #[test]
    fn test_apply_settings_reinitializes() {
        let settings = settings_with(5, "256,512,1024,4096,8192");
        let manager = BucketManager::new(&settings);

        let replacement = settings_with(6, "100,200,300,400,500,600");
        manager.apply_settings(&replacement);
        assert_eq!(manager.boundaries(), vec![100, 200, 300, 400, 500, 600]);
        assert_eq!(manager.weights().len(), 6);
    }
}
