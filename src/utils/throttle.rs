//! Per-key log suppression
//!
//! The framed-socket reader and the HID key map can hit the same failure
//! thousands of times per second (a misbehaving encoder, a client that keeps
//! sending an unmapped key name). Call sites ask the throttler before
//! logging so each distinct key is reported once per interval, or exactly
//! once when no interval is set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Limits how often a log line with the same key is emitted.
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    /// `None` means a key is logged exactly once for the process lifetime.
    interval: Option<Duration>,
}

impl LogThrottler {
    /// Throttler that logs each key at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval: Some(interval),
        }
    }

    /// Throttler that logs each key exactly once.
    pub fn once() -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval: None,
        }
    }

    /// Returns `true` if the caller should log now; records the attempt.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock().unwrap();

        match (map.get(key), self.interval) {
            (Some(_), None) => false,
            (Some(last), Some(interval)) if now.duration_since(*last) < interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget a key so its next occurrence is logged immediately.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().unwrap().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interval_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));

        thread::sleep(Duration::from_millis(80));
        assert!(throttler.should_log("key"));
    }

    #[test]
    fn test_once_logs_a_key_a_single_time() {
        let throttler = LogThrottler::once();

        assert!(throttler.should_log("pause"));
        assert!(!throttler.should_log("pause"));
        assert!(throttler.should_log("other"));
    }

    #[test]
    fn test_clear_resets_a_key() {
        let throttler = LogThrottler::once();

        assert!(throttler.should_log("key"));
        throttler.clear("key");
        assert!(throttler.should_log("key"));
    }
}
