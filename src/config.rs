use std::time::Duration;
use thiserror::Error;

/// Spin delay used when none is configured: 100 µs.
pub const DEFAULT_SPIN_DELAY: Duration = Duration::from_nanos(100_000);

/// Longest spin delay a stack accepts: 1 s.
pub const MAX_SPIN_DELAY: Duration = Duration::from_secs(1);

/// Error types for invalid stack configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The elimination arrays need at least one slot
    #[error("concurrency level must be at least 1")]
    ZeroConcurrencyLevel,
    /// Elimination attempts would stall their thread for too long
    #[error("spin delay of {delay:?} exceeds the maximum of {max:?}")]
    SpinDelayTooLarge { delay: Duration, max: Duration },
}

/// Tuning parameters for an [`EliminationBackoffStack`].
///
/// # Examples
/// ```
/// use lfds::StackConfig;
/// use std::time::Duration;
///
/// let config = StackConfig::new(8)
///     .spin_delay(Duration::from_micros(50))
///     .spin_jitter(true);
/// assert!(config.validate().is_ok());
/// ```
///
/// [`EliminationBackoffStack`]: crate::EliminationBackoffStack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Number of threads that may be registered at once. Also the size of the
    /// elimination and collision arrays.
    pub concurrency_level: usize,
    /// How long an elimination attempt waits for a partner before giving up.
    pub spin_delay: Duration,
    /// Wait a random duration in `[spin_delay / 2, spin_delay]` instead of the
    /// full delay, so that threads that failed together do not retry together.
    pub spin_jitter: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl StackConfig {
    pub fn new(concurrency_level: usize) -> Self {
        Self {
            concurrency_level,
            spin_delay: DEFAULT_SPIN_DELAY,
            spin_jitter: false,
        }
    }

    pub fn spin_delay(mut self, delay: Duration) -> Self {
        self.spin_delay = delay;
        self
    }

    pub fn spin_jitter(mut self, enabled: bool) -> Self {
        self.spin_jitter = enabled;
        self
    }

    /// Checks the configuration without building a stack.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_level == 0 {
            return Err(ConfigError::ZeroConcurrencyLevel);
        }
        if self.spin_delay > MAX_SPIN_DELAY {
            return Err(ConfigError::SpinDelayTooLarge {
                delay: self.spin_delay,
                max: MAX_SPIN_DELAY,
            });
        }
        Ok(())
    }
}
