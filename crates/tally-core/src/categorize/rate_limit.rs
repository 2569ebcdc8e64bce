//! In-process throttle on LLM calls
//!
//! The budget ledger caps spend per day and month for each organization.
//! The limiter caps request bursts and hourly spend for this process, over
//! a sliding window. Each prompt chunk counts as one request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;
use crate::error::{Error, Result};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct Request {
    at: Instant,
    cost: f64,
}

/// Sliding-window limiter shared by clones
#[derive(Clone)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    window: Arc<Mutex<VecDeque<Request>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            window: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Refuse when `requests` more calls costing `estimated_cost` would
    /// exceed any limit
    pub fn check_limit(&self, requests: u32, estimated_cost: f64) -> Result<()> {
        self.check_at(Instant::now(), requests, estimated_cost)
    }

    /// Count completed calls and what they cost
    pub fn record_request(&self, requests: u32, actual_cost: f64) {
        self.record_at(Instant::now(), requests, actual_cost);
    }

    /// Requests and spend inside the current hour
    pub fn usage(&self) -> (u32, f64) {
        let mut window = self.lock();
        prune(&mut window, Instant::now());
        (window.len() as u32, window.iter().map(|r| r.cost).sum())
    }

    fn check_at(&self, now: Instant, requests: u32, estimated_cost: f64) -> Result<()> {
        let mut window = self.lock();
        prune(&mut window, now);

        let last_minute = window
            .iter()
            .filter(|r| now.saturating_duration_since(r.at) < MINUTE)
            .count() as u32;
        let last_hour = window.len() as u32;
        let hour_cost: f64 = window.iter().map(|r| r.cost).sum();
        let limits = &self.settings;

        if limits.max_requests_per_minute > 0 && last_minute + requests > limits.max_requests_per_minute {
            return Err(Error::RateLimited(format!(
                "per-minute request limit reached ({} + {} > {})",
                last_minute, requests, limits.max_requests_per_minute
            )));
        }
        if limits.max_requests_per_hour > 0 && last_hour + requests > limits.max_requests_per_hour {
            return Err(Error::RateLimited(format!(
                "hourly request limit reached ({} + {} > {})",
                last_hour, requests, limits.max_requests_per_hour
            )));
        }
        if limits.max_cost_per_hour > 0.0 && hour_cost + estimated_cost > limits.max_cost_per_hour {
            return Err(Error::RateLimited(format!(
                "hourly cost limit would be exceeded (${:.4} + ${:.4} > ${:.4})",
                hour_cost, estimated_cost, limits.max_cost_per_hour
            )));
        }
        Ok(())
    }

    fn record_at(&self, now: Instant, requests: u32, actual_cost: f64) {
        if requests == 0 {
            return;
        }
        let mut window = self.lock();
        prune(&mut window, now);
        let each = actual_cost / f64::from(requests);
        for _ in 0..requests {
            window.push_back(Request { at: now, cost: each });
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Request>> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn prune(window: &mut VecDeque<Request>, now: Instant) {
    while window
        .front()
        .is_some_and(|r| now.saturating_duration_since(r.at) >= HOUR)
    {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, per_hour: u32, cost_per_hour: f64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            max_requests_per_minute: per_minute,
            max_requests_per_hour: per_hour,
            max_cost_per_hour: cost_per_hour,
        })
    }

    #[test]
    fn test_hourly_request_cap() {
        let limiter = limiter(0, 3, 0.0);
        let start = Instant::now();

        limiter.check_at(start, 2, 0.0).unwrap();
        limiter.record_at(start, 2, 0.0);
        limiter.check_at(start, 1, 0.0).unwrap();
        limiter.record_at(start, 1, 0.0);

        let err = limiter.check_at(start + MINUTE, 1, 0.0).unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        assert!(!err.is_fatal());

        // The window slides
        limiter.check_at(start + HOUR, 1, 0.0).unwrap();
    }

    #[test]
    fn test_minute_cap_recovers() {
        let limiter = limiter(2, 0, 0.0);
        let start = Instant::now();
        limiter.record_at(start, 2, 0.0);

        assert!(limiter.check_at(start + Duration::from_secs(30), 1, 0.0).is_err());
        assert!(limiter.check_at(start + MINUTE, 1, 0.0).is_ok());
    }

    #[test]
    fn test_hourly_cost_cap() {
        let limiter = limiter(0, 0, 0.01);
        let start = Instant::now();
        limiter.record_at(start, 2, 0.008);

        assert!(limiter.check_at(start, 1, 0.001).is_ok());
        assert!(limiter.check_at(start, 1, 0.003).is_err());
    }

    #[test]
    fn test_zero_disables_limits() {
        let limiter = limiter(0, 0, 0.0);
        let start = Instant::now();
        limiter.record_at(start, 10_000, 500.0);
        assert!(limiter.check_at(start, 10_000, 500.0).is_ok());
    }

    #[test]
    fn test_clones_share_window() {
        let limiter = limiter(0, 1, 0.0);
        let clone = limiter.clone();
        clone.record_request(1, 0.0);
        assert_eq!(limiter.usage().0, 1);
        assert!(limiter.check_limit(1, 0.0).is_err());
    }
}
