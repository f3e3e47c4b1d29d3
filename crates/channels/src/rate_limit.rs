//! Per-user rate limiting over a rolling minute.
//!
//! Token-bucket keyed by user id: within any rolling 60-second window at
//! most `max_per_minute` calls to [`RateLimiter::allow`] return `true`
//! for a given user.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct RateLimiter {
    max_per_minute: u32,
    /// Per-user timestamps of allowed calls within the window.
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

const WINDOW: Duration = Duration::from_secs(60);

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, user: &str) -> bool {
        self.allow_at(user, Instant::now())
    }

    /// Testable entry point with an explicit clock.
    pub fn allow_at(&self, user: &str, now: Instant) -> bool {
        if self.max_per_minute == 0 {
            return false;
        }
        let mut windows = self.windows.lock();
        let window = windows.entry(user.to_owned()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= self.max_per_minute {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop users with no activity in the current window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows
            .lock()
            .retain(|_, w| w.back().map_or(false, |t| now.duration_since(*t) < WINDOW));
    }
}
