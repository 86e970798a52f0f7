//! Time seam for the reconcile loop
//!
//! Every timer in a rollout (batch interval, bake window, smoke timeout) is
//! measured against [`Clock::now`]. `SystemClock` runs in production;
//! `MockClock` lets tests step a rollout through its timers.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock
#[cfg(test)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Clock fixed at an RFC3339 instant
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .expect("MockClock needs an RFC3339 timestamp")
            .with_timezone(&Utc);
        Self::new(now)
    }

    pub fn advance_secs(&self, seconds: i64) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += chrono::Duration::seconds(seconds);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
