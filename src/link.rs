//! Link health tracking shared by the serial links
//!
//! [`LinkHealth`] drives reconnect backoff: the first retry waits 1 s, every
//! failed attempt doubles the wait up to 30 s, and a successful open resets it.
//! [`StalenessGuard`] faults a link that is open but has stopped producing valid
//! data.
//!
//! Both types take the current instant as an argument so their behaviour is a pure
//! function of time.

use std::time::Duration;

use tokio::time::Instant;

/// Initial reconnect delay
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for the reconnect delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(30_000);

/// Open/faulted state and reconnect backoff of one physical link
#[derive(Debug, Clone)]
pub struct LinkHealth {
    is_open: bool,
    is_faulted: bool,
    last_retry: Option<Instant>,
    retry_delay: Duration,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkHealth {
    pub fn new() -> Self {
        Self {
            is_open: false,
            is_faulted: false,
            last_retry: None,
            retry_delay: INITIAL_RETRY_DELAY,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_faulted(&self) -> bool {
        self.is_faulted
    }

    /// Open and not faulted
    pub fn is_healthy(&self) -> bool {
        self.is_open && !self.is_faulted
    }

    /// Current reconnect delay
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn last_retry(&self) -> Option<Instant> {
        self.last_retry
    }

    /// Whether a connect attempt is allowed at `now`
    ///
    /// Returns `false` while the link is healthy or while the backoff since the last
    /// attempt has not elapsed.
    pub fn should_attempt(&self, now: Instant) -> bool {
        if self.is_healthy() {
            return false;
        }
        match self.last_retry {
            Some(last) => now.saturating_duration_since(last) >= self.retry_delay,
            None => true,
        }
    }

    /// Record the start of a connect attempt
    pub fn begin_attempt(&mut self, now: Instant) {
        self.last_retry = Some(now);
    }

    /// Connect attempt succeeded
    pub fn record_success(&mut self) {
        self.is_open = true;
        self.is_faulted = false;
        self.retry_delay = INITIAL_RETRY_DELAY;
    }

    /// Connect attempt failed; doubles the delay up to [`MAX_RETRY_DELAY`]
    pub fn record_failure(&mut self) {
        self.is_open = false;
        self.is_faulted = true;
        self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_DELAY);
    }

    /// An I/O path hit an error; the next access tries to reopen
    pub fn mark_faulted(&mut self) {
        self.is_faulted = true;
    }

    /// Forget the backoff so the next access reconnects immediately
    pub fn reset(&mut self) {
        self.is_open = false;
        self.is_faulted = false;
        self.last_retry = None;
        self.retry_delay = INITIAL_RETRY_DELAY;
    }
}

/// Faults a link that stays silent for too long or keeps failing
///
/// The link is considered stale once no valid data has arrived for `window`, or after
/// `max_failures` consecutive failed reads.
#[derive(Debug, Clone)]
pub struct StalenessGuard {
    window: Duration,
    max_failures: u32,
    last_data: Option<Instant>,
    consecutive_failures: u32,
}

impl StalenessGuard {
    pub fn new(window: Duration, max_failures: u32) -> Self {
        Self {
            window,
            max_failures,
            last_data: None,
            consecutive_failures: 0,
        }
    }

    /// Valid data arrived
    pub fn record_data(&mut self, now: Instant) {
        self.last_data = Some(now);
        self.consecutive_failures = 0;
    }

    /// A read produced nothing usable; returns `true` when the failure limit is hit
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.max_failures {
            self.consecutive_failures = 0;
            return true;
        }
        false
    }

    /// Returns `true` once if the data window has expired
    ///
    /// The timestamp is cleared after reporting so a dead link is not reported on
    /// every poll.
    pub fn check_expired(&mut self, now: Instant) -> bool {
        match self.last_data {
            Some(last) if now.saturating_duration_since(last) > self.window => {
                self.last_data = None;
                true
            }
            _ => false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_data(&self) -> Option<Instant> {
        self.last_data
    }

    pub fn reset(&mut self) {
        self.last_data = None;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_one_second() {
        let mut health = LinkHealth::new();
        let mut delays = Vec::new();
        for _ in 0..3 {
            delays.push(health.retry_delay().as_millis());
            health.record_failure();
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);
    }

    #[test]
    fn test_backoff_caps_and_resets() {
        let mut health = LinkHealth::new();
        for _ in 0..10 {
            health.record_failure();
            assert!(health.retry_delay() <= MAX_RETRY_DELAY);
            assert!(health.retry_delay() >= INITIAL_RETRY_DELAY);
        }
        assert_eq!(health.retry_delay(), MAX_RETRY_DELAY);

        health.record_success();
        assert_eq!(health.retry_delay(), INITIAL_RETRY_DELAY);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_attempts_are_rate_limited() {
        let t0 = Instant::now();
        let mut health = LinkHealth::new();
        assert!(health.should_attempt(t0));

        health.begin_attempt(t0);
        health.record_failure();
        assert!(!health.should_attempt(t0 + Duration::from_millis(1999)));
        assert!(health.should_attempt(t0 + Duration::from_millis(2000)));
    }

    #[test]
    fn test_fault_after_io_error_retries_immediately() {
        let t0 = Instant::now();
        let mut health = LinkHealth::new();
        health.begin_attempt(t0);
        health.record_success();
        assert!(!health.should_attempt(t0));

        health.mark_faulted();
        assert!(health.should_attempt(t0 + INITIAL_RETRY_DELAY));
    }

    #[test]
    fn test_staleness_window() {
        let t0 = Instant::now();
        let mut guard = StalenessGuard::new(Duration::from_secs(10), 3);
        assert!(!guard.check_expired(t0 + Duration::from_secs(60)));

        guard.record_data(t0);
        assert!(!guard.check_expired(t0 + Duration::from_secs(10)));
        assert!(guard.check_expired(t0 + Duration::from_millis(10_001)));
        assert!(!guard.check_expired(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn test_consecutive_failures() {
        let mut guard = StalenessGuard::new(Duration::from_secs(10), 3);
        assert!(!guard.record_failure());
        assert!(!guard.record_failure());
        assert!(guard.record_failure());
        assert_eq!(guard.consecutive_failures(), 0);

        guard.record_failure();
        guard.record_data(Instant::now());
        assert_eq!(guard.consecutive_failures(), 0);
    }
}
