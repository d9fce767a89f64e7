//! Recovery ladder
//!
//! Maps a 1-based attempt index to a remediation strategy and the backoff
//! to wait before running it. The ladder itself keeps no state; the attempt
//! counter lives in the owning session.

use std::fmt;
use std::time::Duration;

use crate::config::{PlaybackConfig, MAX_RECOVERY_ATTEMPTS};

/// Remediation strategies, mildest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Pause and resume segment loading on the existing decoder
    SoftReload,
    /// Destroy and recreate the decoder against the same URL
    HardReload,
    /// Tear everything down, wait, then load from scratch
    FullReset,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::SoftReload => write!(f, "soft reload"),
            RecoveryStrategy::HardReload => write!(f, "hard reload"),
            RecoveryStrategy::FullReset => write!(f, "full reset"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub strategy: RecoveryStrategy,
    /// Backoff before the action runs
    pub delay: Duration,
}

/// Attempt-indexed recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RecoveryPolicy {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            max_attempts: config.max_recovery_attempts.min(MAX_RECOVERY_ATTEMPTS),
            base_delay: Duration::from_millis(config.recovery_base_delay_ms as u64),
            max_delay: Duration::from_millis(config.recovery_max_delay_ms as u64),
        }
    }

    /// Plan for `attempt` (1-based). `None` once the attempt exceeds the budget.
    pub fn plan(&self, attempt: u32) -> Option<RecoveryPlan> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let strategy = match attempt {
            1 => RecoveryStrategy::SoftReload,
            2 => RecoveryStrategy::HardReload,
            _ => RecoveryStrategy::FullReset,
        };

        Some(RecoveryPlan {
            strategy,
            delay: self.backoff(attempt),
        })
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}
