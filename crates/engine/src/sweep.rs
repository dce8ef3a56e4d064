use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use vault_core::UserId;

/// Per-user rate limit for the request-triggered sweep.
///
/// Lives only in memory. Losing it (restart) costs one extra sweep per user;
/// it never affects which tracks are eligible.
pub struct SweepThrottle {
    interval: Duration,
    last_run: Mutex<HashMap<UserId, DateTime<Utc>>>,
}

impl SweepThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Records a run for `user_id` and returns true if the previous one is at
    /// least `interval` old (or there was none). A clock that went backwards
    /// counts as due.
    pub fn try_claim(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        let mut last_run = match self.last_run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = match last_run.get(&user_id) {
            Some(last) => {
                let elapsed = now.signed_duration_since(*last);
                elapsed >= self.interval || elapsed < Duration::zero()
            }
            None => true,
        };
        if due {
            last_run.insert(user_id, now);
        }
        due
    }
}
