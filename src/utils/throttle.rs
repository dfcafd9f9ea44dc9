//! Rate limiting for repeated log lines
//!
//! Fanout sends to viewers without an open data channel are dropped silently;
//! logging each drop would flood the output while a viewer is still
//! negotiating, so drops are reported at most once per interval per key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often a log line with the same key is emitted
///
/// Keys are free-form; viewers use the data-channel label so that drops on
/// one channel do not silence another. A key is remembered until it is
/// cleared, so callers clear it once the condition being reported is gone.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use whip_broadcast::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("broadcaster"));
/// assert!(!throttler.should_log("broadcaster"));
/// ```
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler that lets one line per key through every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Shorthand for [`LogThrottler::new`] with a whole number of seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when the line for `key` should be emitted now and
    /// records the emission time.
    ///
    /// The first call for a key always returns `true`.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget a key so its next line is emitted immediately
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

/// One line per key every five seconds
impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::debug!`
///
/// Takes the throttler, the key, then the usual `tracing` arguments.
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}

/// Throttled `tracing::warn!`
///
/// Same arguments as [`debug_throttled!`].
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("viewer-1/broadcaster"));
        assert!(!throttler.should_log("viewer-1/broadcaster"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("viewer-1/broadcaster"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("viewer-1/broadcaster"));
        assert!(throttler.should_log("viewer-2/broadcaster"));
        assert!(!throttler.should_log("viewer-1/broadcaster"));
        assert!(!throttler.should_log("viewer-2/broadcaster"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        throttler.should_log("broadcaster");
        throttler.should_log("chat");
        throttler.clear("chat");
        assert!(throttler.should_log("chat"));
        assert!(!throttler.should_log("broadcaster"));

        // Clearing an unknown key is a no-op
        throttler.clear("unknown");
        assert!(!throttler.should_log("chat"));
    }
}
