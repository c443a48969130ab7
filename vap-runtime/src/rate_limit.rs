//! Admission rate limiting: accepted jobs per trailing 60 seconds.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

pub struct AcceptRateLimiter {
    max_per_minute: u32,
    accepts: Mutex<VecDeque<Instant>>,
}

impl AcceptRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self { max_per_minute, accepts: Mutex::new(VecDeque::new()) }
    }

    /// Record an acceptance if the trailing window has room. Returns
    /// `false` when the caller must skip this admission.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut accepts = match self.accepts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(front) = accepts.front() {
            if now.duration_since(*front) >= WINDOW {
                accepts.pop_front();
            } else {
                break;
            }
        }
        if accepts.len() < self.max_per_minute as usize {
            accepts.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn in_window(&self) -> usize {
        match self.accepts.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced_within_window() {
        let limiter = AcceptRateLimiter::new(3);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(1)));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(2)));
        // The 4th accept inside 60s is skipped.
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(3)));
        assert_eq!(limiter.in_window(), 3);
    }

    #[test]
    fn test_window_slides() {
        let limiter = AcceptRateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(30)));
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(59)));
        // First accept ages out at +60s.
        assert!(limiter.try_acquire_at(start + Duration::from_secs(61)));
        // But the +30s accept still occupies the window.
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(62)));
    }

    #[test]
    fn test_zero_limit_always_refuses() {
        let limiter = AcceptRateLimiter::new(0);
        assert!(!limiter.try_acquire_at(Instant::now()));
    }
}
