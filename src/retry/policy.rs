use std::time::Duration;

/// Attempt bound and backoff schedule for [`TransactionRetryExecutor`].
///
/// The attempt counter is checked before every attempt: once it reaches
/// `max_attempts` the executor gives up, so the operation itself runs at most
/// `max_attempts - 1` times.
///
/// [`TransactionRetryExecutor`]: crate::TransactionRetryExecutor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Value of the attempt counter at which the executor gives up.
    pub max_attempts: u32,
    /// Delay unit; the backoff after attempt `n` is `base_backoff * multiplier^n`.
    pub base_backoff: Duration,
    /// Growth factor of the exponential backoff.
    pub multiplier: u32,
    /// Upper bound for a single backoff. `None` lets the delay grow unbounded.
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            base_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the attempt bound
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff time unit
    pub fn base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Set the exponential growth factor
    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Cap every backoff at `cap`
    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    /// Maximum number of times the operation can be executed under this policy.
    pub fn max_executions(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Delay slept after a serialization conflict on attempt `attempt` (1-based).
    ///
    /// Computed with saturating arithmetic, then clamped to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_backoff
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 2 {
            return Err("max_attempts must be >= 2 for the operation to run at least once".to_string());
        }

        if self.multiplier == 0 {
            return Err("multiplier must be > 0".to_string());
        }

        if let Some(cap) = self.max_backoff {
            if cap < self.base_backoff {
                return Err("max_backoff cannot be smaller than base_backoff".to_string());
            }
        }

        Ok(())
    }
}
