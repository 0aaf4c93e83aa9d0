//! Engine configuration.
//!
//! Every struct has a `Default` matching the production defaults and
//! deserializes with `#[serde(default)]`, so a JSON document only needs the
//! fields it overrides.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name used in log output.
    pub name: String,
    pub await_manager: AwaitManagerConfig,
    pub shutdown: ShutdownConfig,
    pub inflight: InFlightConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            await_manager: AwaitManagerConfig::default(),
            shutdown: ShutdownConfig::default(),
            inflight: InFlightConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and any error from
    /// [`EngineConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if any section holds an out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shutdown.validate()?;
        self.watchdog.validate()
    }
}

/// Settings for the [`AwaitManager`](crate::AwaitManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwaitManagerConfig {
    /// Interrupt every blocked caller when the manager stops, so a controlled
    /// shutdown never hangs on an abandoned synchronous caller.
    pub interrupt_threads_while_stopping: bool,
    /// Record blocked/interrupted counts and wait durations.
    pub statistics_enabled: bool,
}

impl Default for AwaitManagerConfig {
    fn default() -> Self {
        Self {
            interrupt_threads_while_stopping: true,
            statistics_enabled: true,
        }
    }
}

/// Time unit paired with [`ShutdownConfig::timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Converts `amount` of this unit into a `Duration`, saturating on overflow.
    #[must_use]
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(amount),
            Self::Microseconds => Duration::from_micros(amount),
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
            Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            Self::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            Self::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

/// Settings for the [`ShutdownCoordinator`](crate::ShutdownCoordinator).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Graceful shutdown timeout, in `time_unit`. Must be positive.
    pub timeout: u64,
    pub time_unit: TimeUnit,
    /// Force the remaining routes to stop once the timeout elapses.
    pub shutdown_now_on_timeout: bool,
    /// Stop routes in reverse startup order.
    pub shutdown_routes_in_reverse_order: bool,
    /// Demote failures logged during a timed-out shutdown to TRACE.
    pub suppress_logging_on_timeout: bool,
    /// Log the exchanges still in flight when the timeout elapses.
    pub log_inflight_exchanges_on_timeout: bool,
    /// Interval between pending-exchange checks while draining.
    pub poll_interval_ms: u64,
    /// How long a forced shutdown waits, in total, for in-flight exchanges to
    /// drain after the consumers were stopped and blocked callers interrupted.
    pub forced_stop_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: 45,
            time_unit: TimeUnit::Seconds,
            shutdown_now_on_timeout: true,
            shutdown_routes_in_reverse_order: true,
            suppress_logging_on_timeout: false,
            log_inflight_exchanges_on_timeout: true,
            poll_interval_ms: 10,
            forced_stop_timeout_ms: 1_000,
        }
    }
}

impl ShutdownConfig {
    /// The timeout as a `Duration`.
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        self.time_unit.to_duration(self.timeout)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::NonPositiveTimeout` if `timeout` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::NonPositiveTimeout);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "shutdown.poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for the [`InFlightRegistry`](crate::InFlightRegistry).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InFlightConfig {
    /// When false, `browse` and `oldest` return empty results.
    pub browse_enabled: bool,
}

impl Default for InFlightConfig {
    fn default() -> Self {
        Self {
            browse_enabled: true,
        }
    }
}

/// Settings for the stuck-thread watchdog.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    /// Blocked longer than this is reported at WARN (once per exchange).
    pub warn_after_ms: u64,
    /// Blocked longer than this is interrupted. `None` never interrupts.
    pub interrupt_after_ms: Option<u64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval_ms: 1_000,
            warn_after_ms: 30_000,
            interrupt_after_ms: None,
        }
    }
}

impl WatchdogConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a zero scan interval or an interrupt
    /// threshold below the warn threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "watchdog.scan_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if let Some(interrupt) = self.interrupt_after_ms {
            if interrupt < self.warn_after_ms {
                return Err(ConfigError::Invalid {
                    field: "watchdog.interrupt_after_ms",
                    reason: format!("must not be below warn_after_ms ({})", self.warn_after_ms),
                });
            }
        }
        Ok(())
    }
}
