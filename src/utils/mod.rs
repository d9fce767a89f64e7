//! Shared utilities

pub mod throttle;

pub use throttle::LogThrottler;

/// Strip the query string (which may carry credentials) from a URL before logging it
pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}
