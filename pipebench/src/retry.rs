//! Bounded-retry backoff driver for best-effort startup RPCs.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A single-use retry driver with a growing per-attempt timeout.
///
/// [`ExponentialBackoff::run`] invokes the operated function with the number
/// of remaining retries and the timeout it should honour, until the function
/// succeeds, the retries are exhausted, or the transport reports shutdown.
/// The outcome of the last attempt is returned either way.
///
/// The timeout schedule multiplies the current timeout by the 1-indexed
/// attempt number, so a 10 ms start yields 10, 20, 60, 240 ms, and so on.
/// `rate` is accepted for configuration compatibility but does not
/// participate in the schedule.
pub struct ExponentialBackoff {
    retries: u32,
    rate: u32,
    start_timeout: Duration,
    attempt: u32,
    current_timeout: Duration,
    used: bool,
    succeeded: bool,
}

impl ExponentialBackoff {
    /// Create a driver with no retries and a zero timeout; configure it
    /// with the `with_*` methods before use.
    pub fn new() -> Self {
        Self {
            retries: 0,
            rate: 1,
            start_timeout: Duration::ZERO,
            attempt: 0,
            current_timeout: Duration::ZERO,
            used: false,
            succeeded: false,
        }
    }

    /// Set the desired number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the nominal growth rate. Unused by the schedule; see the type
    /// docs.
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Set the first attempt's timeout.
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self.current_timeout = start_timeout;
        self
    }

    /// The configured growth rate.
    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Whether the last run ended in success.
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Number of attempts made so far.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Run `f` until it succeeds or the retries are exhausted.
    ///
    /// `f` receives the remaining retry count and the timeout to honour for
    /// this attempt. A [`Error::TransportShutdown`] return short-circuits the
    /// remaining retries and surfaces as [`Error::RequestTimeout`]; a
    /// [`Error::Cancelled`] return short-circuits and is returned as-is.
    /// Running a driver twice fails with [`Error::DuplicateInvocation`]
    /// without invoking `f`.
    pub fn run<T, F>(&mut self, mut f: F) -> Result<T>
    where
        F: FnMut(u32, Duration) -> Result<T>,
    {
        if self.used {
            warn!("retry driver invoked twice");
            return Err(Error::DuplicateInvocation);
        }
        self.used = true;

        let mut last: Result<T> = Err(Error::RequestTimeout);
        while !self.succeeded && self.attempt < self.retries {
            self.attempt += 1;
            self.current_timeout *= self.attempt;
            debug!(
                attempt = self.attempt,
                timeout_ms = self.current_timeout.as_millis() as u64,
                "running retry attempt"
            );
            match f(self.retries - self.attempt, self.current_timeout) {
                Err(Error::TransportShutdown) => {
                    debug!("transport has shut down, stopping retries");
                    self.attempt = self.retries;
                    last = Err(Error::RequestTimeout);
                }
                Err(Error::Cancelled) => {
                    debug!("cancelled, stopping retries");
                    self.attempt = self.retries;
                    last = Err(Error::Cancelled);
                }
                outcome => {
                    self.succeeded = outcome.is_ok();
                    last = outcome;
                }
            }
        }
        last
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(retries: u32) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_retries(retries)
            .with_start_timeout(Duration::from_millis(10))
            .with_rate(3)
    }

    #[test]
    fn test_backoff_schedule() {
        let mut timeouts = Vec::new();
        let mut remaining_seen = Vec::new();
        let mut d = driver(4);
        let result: Result<()> = d.run(|remaining, timeout| {
            remaining_seen.push(remaining);
            timeouts.push(timeout);
            Err(Error::RequestTimeout)
        });
        assert!(matches!(result, Err(Error::RequestTimeout)));
        assert_eq!(
            timeouts,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(60),
                Duration::from_millis(240),
            ]
        );
        assert_eq!(remaining_seen, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_success_stops_retries() {
        let mut calls = 0;
        let mut d = driver(10);
        let result = d.run(|_, _| {
            calls += 1;
            if calls < 4 {
                Err(Error::EmptyResponse)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls, 4);
        assert!(d.succeeded());
        assert_eq!(d.attempts(), 4);
    }

    #[test]
    fn test_last_error_preserved() {
        let mut calls = 0;
        let mut d = driver(3);
        let result: Result<()> = d.run(|_, _| {
            calls += 1;
            if calls < 3 {
                Err(Error::RequestTimeout)
            } else {
                Err(Error::EmptyResponse)
            }
        });
        assert!(matches!(result, Err(Error::EmptyResponse)));
    }

    #[test]
    fn test_duplicate_invocation() {
        let mut d = driver(2);
        let first: Result<()> = d.run(|_, _| Ok(()));
        assert!(first.is_ok());

        let mut invoked = false;
        let second: Result<()> = d.run(|_, _| {
            invoked = true;
            Ok(())
        });
        assert!(matches!(second, Err(Error::DuplicateInvocation)));
        assert!(!invoked);
    }

    #[test]
    fn test_zero_retries_never_invokes() {
        let mut invoked = false;
        let mut d = driver(0);
        let result: Result<()> = d.run(|_, _| {
            invoked = true;
            Ok(())
        });
        assert!(matches!(result, Err(Error::RequestTimeout)));
        assert!(!invoked);
    }

    #[test]
    fn test_shutdown_short_circuits() {
        let mut calls = 0;
        let mut d = driver(10);
        let result: Result<()> = d.run(|_, _| {
            calls += 1;
            Err(Error::TransportShutdown)
        });
        assert!(matches!(result, Err(Error::RequestTimeout)));
        assert_eq!(calls, 1);
        assert!(!d.succeeded());
    }

    #[test]
    fn test_cancel_short_circuits_and_is_preserved() {
        let mut calls = 0;
        let mut d = driver(10);
        let result: Result<()> = d.run(|_, _| {
            calls += 1;
            Err(Error::Cancelled)
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls, 1);
    }
}
