use serde::{Deserialize, Serialize};
use std::time::Duration;
use typeshare::typeshare;

use crate::error::{AppError, Result};

/// Soft reload, hard reload, full reset
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
/// Shortest detection period the session will run
pub const MIN_DETECTION_INTERVAL_MS: u32 = 100;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Stream session liveness and recovery settings
    pub playback: PlaybackConfig,
    /// Realtime event channel settings
    pub channel: ChannelConfig,
    /// Operational backend settings
    pub backend: BackendConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.playback.validate()?;
        self.channel.validate()
    }
}

/// Stream session thresholds
///
/// All durations are in milliseconds; positions are in seconds of media time.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Period of the liveness detection cycle
    pub detection_interval_ms: u32,
    /// Window without any liveness event after which the camera is offline
    pub freshness_timeout_ms: u32,
    /// No-progress-while-playing threshold
    pub freeze_threshold_ms: u32,
    /// Observation window for the stuck-clock strategy
    pub stuck_clock_window_ms: u32,
    /// Minimum play-position advance that counts as progress
    pub stuck_clock_min_advance: f64,
    /// How long low readiness may last before it is a stall
    pub stall_threshold_ms: u32,
    /// Buffered horizon (seconds ahead of the play position) considered exhausted
    pub buffer_exhaustion_horizon: f64,
    /// Silence required before an exhausted buffer is a freeze
    pub buffer_exhaustion_silence_ms: u32,
    /// Recovery attempts before the session reports exhaustion
    pub max_recovery_attempts: u32,
    /// Backoff before the first recovery attempt, doubled per attempt
    pub recovery_base_delay_ms: u32,
    /// Backoff cap
    pub recovery_max_delay_ms: u32,
    /// How long `is_recovering` stays set after an action completes
    pub recovery_settle_ms: u32,
    /// Pause between teardown and re-attach in a full reset
    pub full_reset_delay_ms: u32,
    /// A second fatal media error inside this window escalates to the ladder
    pub media_error_grace_ms: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: 3_000,
            freshness_timeout_ms: 30_000,
            freeze_threshold_ms: 8_000,
            stuck_clock_window_ms: 5_000,
            stuck_clock_min_advance: 0.1,
            stall_threshold_ms: 10_000,
            buffer_exhaustion_horizon: 1.0,
            buffer_exhaustion_silence_ms: 5_000,
            max_recovery_attempts: 3,
            recovery_base_delay_ms: 1_000,
            recovery_max_delay_ms: 10_000,
            recovery_settle_ms: 5_000,
            full_reset_delay_ms: 1_000,
            media_error_grace_ms: 2_000,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.detection_interval_ms < MIN_DETECTION_INTERVAL_MS {
            return Err(invalid(format!(
                "playback.detection_interval_ms must be at least {}",
                MIN_DETECTION_INTERVAL_MS
            )));
        }
        if self.freshness_timeout_ms == 0 {
            return Err(invalid("playback.freshness_timeout_ms must be positive"));
        }
        if self.max_recovery_attempts > MAX_RECOVERY_ATTEMPTS {
            return Err(invalid(format!(
                "playback.max_recovery_attempts must not exceed {}",
                MAX_RECOVERY_ATTEMPTS
            )));
        }
        if self.recovery_max_delay_ms < self.recovery_base_delay_ms {
            return Err(invalid(
                "playback.recovery_max_delay_ms is below recovery_base_delay_ms",
            ));
        }
        for (name, value) in [
            ("stuck_clock_min_advance", self.stuck_clock_min_advance),
            ("buffer_exhaustion_horizon", self.buffer_exhaustion_horizon),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("playback.{} must be a non-negative number", name)));
            }
        }
        Ok(())
    }

    /// Never shorter than [`MIN_DETECTION_INTERVAL_MS`]
    pub fn detection_interval(&self) -> Duration {
        ms(self.detection_interval_ms.max(MIN_DETECTION_INTERVAL_MS))
    }

    pub fn freshness_timeout(&self) -> Duration {
        ms(self.freshness_timeout_ms)
    }

    pub fn freeze_threshold(&self) -> Duration {
        ms(self.freeze_threshold_ms)
    }

    pub fn stuck_clock_window(&self) -> Duration {
        ms(self.stuck_clock_window_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        ms(self.stall_threshold_ms)
    }

    pub fn buffer_exhaustion_silence(&self) -> Duration {
        ms(self.buffer_exhaustion_silence_ms)
    }

    pub fn recovery_settle(&self) -> Duration {
        ms(self.recovery_settle_ms)
    }

    pub fn full_reset_delay(&self) -> Duration {
        ms(self.full_reset_delay_ms)
    }

    pub fn media_error_grace(&self) -> Duration {
        ms(self.media_error_grace_ms)
    }
}

/// Realtime event channel configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// WebSocket endpoint, e.g. "wss://nvr.example.com/ws"
    pub endpoint: String,
    /// Auth token sent as the `token` query parameter
    #[typeshare(skip)]
    pub auth_token: Option<String>,
    /// Ping period while the socket is open
    pub heartbeat_interval_secs: u32,
    /// Delay before the first reconnect attempt
    pub reconnect_base_delay_ms: u32,
    /// Reconnect delay cap
    pub reconnect_max_delay_ms: u32,
    /// Multiplier applied per reconnect attempt
    pub reconnect_factor: f64,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000/ws".to_string(),
            auth_token: None,
            heartbeat_interval_secs: 30,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_factor: 1.5,
            max_reconnect_attempts: 10,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(invalid("channel.heartbeat_interval_secs must be positive"));
        }
        if !self.reconnect_factor.is_finite() || self.reconnect_factor < 1.0 {
            return Err(invalid("channel.reconnect_factor must be at least 1.0"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) as u64)
    }
}

/// Operational backend (stream control and error reporting)
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. "https://nvr.example.com"; reporting is disabled when empty
    pub base_url: String,
    /// Bearer token for backend requests
    #[typeshare(skip)]
    pub api_token: Option<String>,
    /// Request timeout
    pub request_timeout_secs: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: None,
            request_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    pub fn is_enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

fn ms(value: u32) -> Duration {
    Duration::from_millis(value as u64)
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::Config(message.into())
}
