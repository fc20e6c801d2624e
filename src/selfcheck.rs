// Self-check framework
//
// Components report their own health as named checks; the top level
// aggregates them into one report. Checks are cheap and synchronous -
// they read counters, never touch the network.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Error,
}

/// One named health check result.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub reason: Option<String>,
}

impl Check {
    pub fn pass(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            reason: None,
        }
    }

    pub fn warn(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            reason: Some(reason.into()),
        }
    }

    pub fn error(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Error,
            reason: Some(reason.into()),
        }
    }
}

/// Implemented by components that can describe their own health.
pub trait SelfCheck {
    fn self_check(&self) -> Vec<Check>;
}

/// Aggregated report over all components.
#[derive(Debug, Clone, Default)]
pub struct SelfCheckReport {
    pub checks: Vec<Check>,
}

impl SelfCheckReport {
    pub fn extend_from(&mut self, component: &dyn SelfCheck) {
        self.checks.extend(component.self_check());
    }

    pub fn all_passed(&self) -> bool {
        self.checks
            .iter()
            .all(|c| c.status == CheckStatus::Pass)
    }

    pub fn problems(&self) -> impl Iterator<Item = &Check> {
        self.checks
            .iter()
            .filter(|c| c.status != CheckStatus::Pass)
    }
}

/// Attempt/failure counter pair used by networked components to compute
/// an error rate for their checks.
#[derive(Debug, Default)]
pub struct ErrorRate {
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl ErrorRate {
    pub fn record_success(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Failure ratio in [0,1]; zero before any attempt.
    pub fn rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.failures.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Standard check: warn above `threshold` failure rate.
    pub fn check(&self, name: &'static str, threshold: f64) -> Check {
        let rate = self.rate();
        if rate > threshold {
            Check::warn(
                name,
                format!("error rate {:.0}% over {} attempts", rate * 100.0, self.attempts()),
            )
        } else {
            Check::pass(name)
        }
    }
}
