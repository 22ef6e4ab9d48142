use std::time::Duration;

/// Bounded retry budget for a single logical operation. Mirrors the
/// fixed/exponential/never shape used for outbound HTTP calls, generalized
/// here to any transport that wants a retry-with-backoff policy.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    Never,
    Fixed {
        interval: Duration,
        max_attempts: u32,
    },
    Exponential {
        base: Duration,
        max_delay: Duration,
        max_attempts: u32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-indexed), or `None` once the
    /// budget is exhausted and the caller should give up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::Never => None,
            RetryPolicy::Fixed {
                interval,
                max_attempts,
            } => (attempt < *max_attempts).then_some(*interval),
            RetryPolicy::Exponential {
                base,
                max_delay,
                max_attempts,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
                Some(scaled.min(*max_delay))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_never_delays() {
        assert!(RetryPolicy::Never.delay(0).is_none());
    }

    #[test]
    fn exponential_caps_at_max_delay() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            max_attempts: 10,
        };
        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay(5), Some(Duration::from_millis(300)));
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let policy = RetryPolicy::Fixed {
            interval: Duration::from_millis(50),
            max_attempts: 2,
        };
        assert!(policy.delay(0).is_some());
        assert!(policy.delay(1).is_some());
        assert!(policy.delay(2).is_none());
    }
}
