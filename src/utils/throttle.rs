//! Rate limiting for repetitive warnings
//!
//! A camera stuck in a freeze loop or a server that refuses every reconnect
//! produces the same warning for as long as the condition lasts. Each warning
//! is keyed; a key is let through once per window and the repeats in between
//! are counted so the next line that does get through can say how many were
//! swallowed.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    opened: Instant,
    suppressed: u32,
}

/// Per-key warning limiter
///
/// Uses the tokio clock, so it advances with a paused test runtime.
///
/// ```rust
/// use camwatch::utils::LogThrottler;
///
/// let throttler = LogThrottler::with_secs(30);
/// assert_eq!(throttler.admit("cam-1:exhausted"), Some(0));
/// assert_eq!(throttler.admit("cam-1:exhausted"), None);
/// ```
#[derive(Debug)]
pub struct LogThrottler {
    window: Duration,
    keys: Mutex<HashMap<String, Window>>,
}

impl LogThrottler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// `Some(n)` when `key` may be logged now, `n` being the number of
    /// occurrences dropped since it was last let through; `None` otherwise.
    pub fn admit(&self, key: &str) -> Option<u32> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        if let Some(window) = keys.get_mut(key) {
            if now.duration_since(window.opened) < self.window {
                window.suppressed = window.suppressed.saturating_add(1);
                return None;
            }
            let dropped = window.suppressed;
            *window = Window {
                opened: now,
                suppressed: 0,
            };
            return Some(dropped);
        }

        keys.insert(
            key.to_string(),
            Window {
                opened: now,
                suppressed: 0,
            },
        );
        Some(0)
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.admit(key).is_some()
    }

    /// Reset `key` once its condition has cleared
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// `tracing::warn!` behind a [`LogThrottler`] key
///
/// Repeats dropped since the last emitted line are appended as a count.
///
/// ```rust
/// use camwatch::utils::LogThrottler;
/// use camwatch::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "connect", "Connect failed: {}", "refused");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        match $throttler.admit($key) {
            Some(0) => tracing::warn!($($arg)*),
            Some(dropped) => tracing::warn!(
                "{} ({} similar suppressed)",
                format_args!($($arg)*),
                dropped
            ),
            None => {}
        }
    };
}
