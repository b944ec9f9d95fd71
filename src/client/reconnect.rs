//! Reconnect policy and the reconnect task.
//!
//! When the transport drops unexpectedly the client spawns one reconnect
//! task. It waits out the backoff, then goes through the regular connect
//! path; resubscription happens there, never here.
//!
//! # Backoff
//!
//! ```text
//! delay(n) = min(initial_delay * multiplier^n, max_delay)
//! ```
//!
//! `max_attempts = None` retries forever. When attempts run out the client
//! settles in `Disconnected` and consumers see `is_connected() == false`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Weak;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::core::{ClientInner, ConnectMode};

// ============================================================================
// Constants
// ============================================================================

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Retry policy applied after an unexpected disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Cap for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never reconnects.
    #[inline]
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the first delay.
    #[inline]
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    #[inline]
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Bounds the number of attempts.
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Returns the delay before attempt `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Starts a fresh backoff sequence.
    #[inline]
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.initial_delay.is_zero() {
            return Err(Error::config("Reconnect initial delay must be greater than zero"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::config(
                "Reconnect max delay must not be smaller than the initial delay",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config("Reconnect multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Iterator-like state for one reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Returns the next delay, or `None` when the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled {
            return None;
        }
        if let Some(max) = self.policy.max_attempts
            && self.attempt >= max
        {
            return None;
        }

        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Number of delays handed out so far.
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restarts the sequence.
    #[inline]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ============================================================================
// Reconnect Task
// ============================================================================

/// Drives reconnect attempts until one succeeds, the policy runs out, or
/// the client is torn down (`epoch` moves on).
pub(crate) async fn run(client: Weak<ClientInner>, epoch: u64, policy: ReconnectPolicy) {
    let mut backoff = policy.backoff();

    loop {
        let Some(delay) = backoff.next_delay() else {
            if let Some(client) = client.upgrade() {
                client.reconnect_exhausted(epoch, backoff.attempt());
            }
            return;
        };

        debug!(
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnect"
        );
        sleep(delay).await;

        let Some(client) = client.upgrade() else {
            return;
        };
        if !client.is_current_epoch(epoch) {
            debug!("Reconnect cancelled by disconnect");
            return;
        }

        match client.connect_with(ConnectMode::Reconnect).await {
            Ok(()) => {
                info!(attempts = backoff.attempt(), "Reconnected");
                return;
            }
            Err(e) if e.is_recoverable() => {
                warn!(attempt = backoff.attempt(), error = %e, "Reconnect attempt failed");
            }
            Err(e) => {
                error!(attempt = backoff.attempt(), error = %e, "Reconnect attempt rejected");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
