use serde::{Deserialize, Serialize};

/// Maximum default backoff delay (1 hour)
pub const MAX_BACKOFF_DELAY: u64 = 3_600_000;

/// Backoff strategy types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Exponential => "exponential",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fixed" => Some(BackoffStrategy::Fixed),
            "exponential" => Some(BackoffStrategy::Exponential),
            _ => None,
        }
    }
}

/// Backoff options for job retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffOptions {
    /// Type of backoff strategy
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds
    pub delay: u64,
    /// Upper bound for any single delay in milliseconds
    pub cap: u64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        BackoffOptions {
            strategy: BackoffStrategy::default(),
            delay: 1000,
            cap: MAX_BACKOFF_DELAY,
        }
    }
}

impl BackoffOptions {
    pub fn fixed(delay: u64) -> Self {
        BackoffOptions {
            strategy: BackoffStrategy::Fixed,
            delay,
            cap: MAX_BACKOFF_DELAY.max(delay),
        }
    }

    pub fn exponential(delay: u64, cap: u64) -> Self {
        BackoffOptions {
            strategy: BackoffStrategy::Exponential,
            delay,
            cap,
        }
    }

    /// Delay before retry number `attempts` (1 based)
    pub fn delay_for(&self, attempts: u32) -> u64 {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                // delay * 2^(attempts-1), saturating long before u64 overflow
                let shift = attempts.saturating_sub(1).min(63);
                self.delay.saturating_mul(1u64 << shift)
            }
        };

        delay.min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let options = BackoffOptions::fixed(5000);

        assert_eq!(options.delay_for(1), 5000);
        assert_eq!(options.delay_for(2), 5000);
        assert_eq!(options.delay_for(3), 5000);
    }

    #[test]
    fn test_exponential_backoff() {
        let options = BackoffOptions::exponential(1000, MAX_BACKOFF_DELAY);

        assert_eq!(options.delay_for(1), 1000);
        assert_eq!(options.delay_for(2), 2000);
        assert_eq!(options.delay_for(3), 4000);
        assert_eq!(options.delay_for(4), 8000);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let options = BackoffOptions::exponential(1000, 5000);

        assert_eq!(options.delay_for(3), 4000);
        assert_eq!(options.delay_for(4), 5000);
        assert_eq!(options.delay_for(200), 5000);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(BackoffStrategy::parse("fixed"), Some(BackoffStrategy::Fixed));
        assert_eq!(BackoffStrategy::parse(BackoffStrategy::Exponential.as_str()), Some(BackoffStrategy::Exponential));
        assert_eq!(BackoffStrategy::parse("custom"), None);
    }
}
