//! Error backoff handling

use std::time::Duration;

/// Configuration for how long to wait before retrying after an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Retries every 60 seconds, without growth
    fn default() -> Self {
        Self::fixed(Duration::from_secs(60))
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff is multiplied by `multiplier`, with a cap of
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }

    /// A backoff that always waits `delay`
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1)
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that tracks consecutive failures
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
        }
    }

    /// Reports a success, resetting the delay
    pub fn success(&mut self) {
        self.last_delay = None;
    }

    /// Reports a failure and returns how long to wait before the next attempt
    pub fn error(&mut self) -> Duration {
        let new_delay = self
            .last_delay
            .map(|d| {
                d.saturating_mul(self.config.multiplier)
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        new_delay
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_a_fixed_minute() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::default());
        for _ in 0..5 {
            assert_eq!(handler.error(), Duration::from_secs(60));
        }
    }

    #[test]
    fn grows_until_capped_and_resets_on_success() {
        let mut handler = ErrorBackoffHandler::new(ErrorBackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            2,
        ));

        assert_eq!(handler.error(), Duration::from_millis(100));
        assert_eq!(handler.error(), Duration::from_millis(200));
        assert_eq!(handler.error(), Duration::from_millis(350));

        let ok: Result<(), ()> = Ok(());
        ok.with_backoff(&mut handler).unwrap();
        assert_eq!(handler.error(), Duration::from_millis(100));
    }
}
