use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::db::config::HealthCheckConfig;

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error),
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckSnapshot {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp_ms: Option<u64>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct HealthTracker {
    config: HealthCheckConfig,
    consecutive_failures: u32,
    last_result: Option<HealthCheckResult>,
    window: VecDeque<bool>,
}

impl HealthTracker {
    const WINDOW_SIZE: usize = 10;

    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            last_result: None,
            window: VecDeque::new(),
        }
    }

    pub fn process(&mut self, result: HealthCheckResult) {
        self.window.push_back(result.healthy);
        if self.window.len() > Self::WINDOW_SIZE {
            self.window.pop_front();
        }

        if result.healthy {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures == self.config.failure_threshold {
                tracing::warn!(
                    failures = self.consecutive_failures,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "database health check failure threshold reached"
                );
            }
        }

        self.last_result = Some(result);
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < self.config.failure_threshold
            && self
                .last_result
                .as_ref()
                .map(|result| result.healthy)
                .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HealthCheckSnapshot {
        HealthCheckSnapshot {
            healthy: self.is_healthy(),
            latency_ms: self.last_result.as_ref().and_then(|r| r.latency_ms),
            error: self.last_result.as_ref().and_then(|r| r.error.clone()),
            timestamp_ms: self.last_result.as_ref().map(|r| r.timestamp_ms),
            consecutive_failures: self.consecutive_failures,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(500),
            failure_threshold: 3,
        }
    }

    #[test]
    fn test_tracker_marks_unhealthy_after_threshold() {
        let mut tracker = HealthTracker::new(config());
        tracker.process(HealthCheckResult::healthy(Duration::from_millis(5)));
        assert!(tracker.is_healthy());

        for _ in 0..3 {
            tracker.process(HealthCheckResult::unhealthy("refused".to_string()));
        }
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.snapshot().consecutive_failures, 3);
    }

    #[test]
    fn test_tracker_recovers_on_success() {
        let mut tracker = HealthTracker::new(config());
        for _ in 0..5 {
            tracker.process(HealthCheckResult::unhealthy("refused".to_string()));
        }
        tracker.process(HealthCheckResult::healthy(Duration::from_millis(2)));
        assert!(tracker.is_healthy());
    }
}
