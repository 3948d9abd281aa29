use std::sync::Mutex;

use crate::gateway_util::now_ms;

/// Per-instance admission budget over a coarse rolling minute.
///
/// This is deliberately a window counter rather than a token bucket: a
/// successful acquire debits the budget until the window rolls, and there is
/// no release when the request finishes.
#[derive(Debug, Default)]
pub struct InstanceBudget {
    window: Mutex<BudgetWindow>,
}

#[derive(Debug, Default)]
struct BudgetWindow {
    window_start_ms: i64,
    used_rpm: u32,
    used_tpm: u64,
}

const WINDOW_MS: i64 = 60_000;

impl InstanceBudget {
    /// Admit one request of `tokens` estimated tokens against the effective
    /// limits. A limit of zero means uncapped on that dimension.
    pub fn try_acquire(&self, tokens: u32, effective_rpm: u32, effective_tpm: u64) -> bool {
        self.try_acquire_at(now_ms(), tokens, effective_rpm, effective_tpm)
    }

    pub(crate) fn try_acquire_at(
        &self,
        now: i64,
        tokens: u32,
        effective_rpm: u32,
        effective_tpm: u64,
    ) -> bool {
        let mut window = match self.window.lock() {
            Ok(window) => window,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.roll(now);

        let next_rpm = window.used_rpm.saturating_add(1);
        let next_tpm = window.used_tpm.saturating_add(tokens as u64);
        if effective_rpm > 0 && next_rpm > effective_rpm {
            return false;
        }
        if effective_tpm > 0 && next_tpm > effective_tpm {
            return false;
        }
        window.used_rpm = next_rpm;
        window.used_tpm = next_tpm;
        true
    }

    /// Remaining request admissions in the current window. Monitoring only.
    pub fn available_rpm(&self, effective_rpm: u32) -> u32 {
        self.available_rpm_at(now_ms(), effective_rpm)
    }

    pub(crate) fn available_rpm_at(&self, now: i64, effective_rpm: u32) -> u32 {
        let mut window = match self.window.lock() {
            Ok(window) => window,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.roll(now);
        effective_rpm.saturating_sub(window.used_rpm)
    }

    /// Remaining token admissions in the current window. Monitoring only.
    pub fn available_tpm(&self, effective_tpm: u64) -> u64 {
        self.available_tpm_at(now_ms(), effective_tpm)
    }

    pub(crate) fn available_tpm_at(&self, now: i64, effective_tpm: u64) -> u64 {
        let mut window = match self.window.lock() {
            Ok(window) => window,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.roll(now);
        effective_tpm.saturating_sub(window.used_tpm)
    }
}

impl BudgetWindow {
    /// Reset the counters when the window has elapsed or the clock moved
    /// backward.
    fn roll(&mut self, now: i64) {
        if now - self.window_start_ms >= WINDOW_MS || now < self.window_start_ms {
            self.window_start_ms = now;
            self.used_rpm = 0;
            self.used_tpm = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_monotonicity() {
        let budget = InstanceBudget::default();
        let now = 1_000_000;
        // rpm=2, tpm=1000: two acquires of 100 tokens pass, the third fails
        assert!(budget.try_acquire_at(now, 100, 2, 1_000));
        assert!(budget.try_acquire_at(now + 1, 100, 2, 1_000));
        assert!(!budget.try_acquire_at(now + 2, 100, 2, 1_000));
    }

    #[test]
    fn test_tpm_breach_rejects() {
        let budget = InstanceBudget::default();
        let now = 1_000_000;
        assert!(budget.try_acquire_at(now, 600, 10, 1_000));
        // 600 + 500 > 1000
        assert!(!budget.try_acquire_at(now + 1, 500, 10, 1_000));
        // but a smaller request still fits
        assert!(budget.try_acquire_at(now + 2, 400, 10, 1_000));
    }

    #[test]
    fn test_window_roll_reenables() {
        let budget = InstanceBudget::default();
        let now = 1_000_000;
        assert!(budget.try_acquire_at(now, 100, 1, 0));
        assert!(!budget.try_acquire_at(now + 59_999, 100, 1, 0));
        assert!(budget.try_acquire_at(now + 60_000, 100, 1, 0));
    }

    #[test]
    fn test_clock_regression_resets() {
        let budget = InstanceBudget::default();
        assert!(budget.try_acquire_at(1_000_000, 100, 1, 0));
        assert!(!budget.try_acquire_at(1_000_001, 100, 1, 0));
        // The clock moving backward resets the window rather than wedging it
        assert!(budget.try_acquire_at(999_000, 100, 1, 0));
    }

    #[test]
    fn test_zero_limit_is_uncapped() {
        let budget = InstanceBudget::default();
        let now = 1_000_000;
        for i in 0..10_000 {
            assert!(budget.try_acquire_at(now + i, 50, 0, 0));
        }
    }

    #[test]
    fn test_available_views() {
        let budget = InstanceBudget::default();
        let now = 1_000_000;
        assert_eq!(budget.available_rpm_at(now, 5), 5);
        assert!(budget.try_acquire_at(now, 100, 5, 1_000));
        assert_eq!(budget.available_rpm_at(now + 1, 5), 4);
        assert_eq!(budget.available_tpm_at(now + 1, 1_000), 900);
        // Views observe the window roll too
        assert_eq!(budget.available_rpm_at(now + 60_000, 5), 5);
    }
}
