// ABOUTME: Keep-alive timing for clients of the codec service
// ABOUTME: Polling manager deciding when to send KeepAlive and tracking failures

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for client keep-alive timing.
///
/// The service ends its session after 10 seconds without any command,
/// so a client that is idle between operations must ping periodically.
/// The default interval of 3 seconds leaves three attempts inside one
/// watchdog window.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Time between `KeepAlive` commands during idle periods.
    pub interval: Duration,

    /// Consecutive failures after which the session is considered dead.
    pub max_failures: u32,

    /// When false, `should_ping` never fires; manual pings are still
    /// tracked.
    pub enabled: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_failures: 3,
            enabled: true,
        }
    }
}

impl KeepAliveConfig {
    pub fn new(interval: Duration) -> Self {
        Self { interval, ..Default::default() }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }
}

/// Decides when a `KeepAlive` command is due and tracks ping health.
///
/// This is a polling model that fits the strictly sequential protocol:
/// there is no background task racing the real commands. The owner of
/// the client asks [`should_ping`](KeepAliveManager::should_ping)
/// between operations, sends the ping itself, and reports the outcome:
///
/// ```rust,no_run
/// # use avpipe::client::{AvClient, KeepAliveConfig, KeepAliveManager};
/// # async fn example(client: &mut AvClient) {
/// let mut keepalive = KeepAliveManager::new(KeepAliveConfig::default());
///
/// if keepalive.should_ping() {
///     keepalive.on_ping_sent();
///     match client.keep_alive().await {
///         Ok(()) => keepalive.on_ping_success(),
///         Err(_) => keepalive.on_ping_failure(),
///     }
/// }
/// if keepalive.is_connection_failed() {
///     // reconnect
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct KeepAliveManager {
    config: KeepAliveConfig,
    last_ping: Option<Instant>,
    consecutive_failures: u32,
}

impl KeepAliveManager {
    pub fn new(config: KeepAliveConfig) -> Self {
        Self { config, last_ping: None, consecutive_failures: 0 }
    }

    /// True when a `KeepAlive` is due: enabled, under the failure
    /// limit, and the interval has elapsed (or no ping was ever sent).
    pub fn should_ping(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.consecutive_failures >= self.config.max_failures {
            debug!("failure limit reached, not pinging");
            return false;
        }
        match self.last_ping {
            None => true,
            Some(last) => last.elapsed() >= self.config.interval,
        }
    }

    /// Record that a `KeepAlive` went out; restarts the interval.
    pub fn on_ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
    }

    pub fn on_ping_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn on_ping_failure(&mut self) {
        self.consecutive_failures += 1;
        warn!(failures = self.consecutive_failures, "keep-alive failed");
    }

    /// Any successful command resets the service's watchdog just like a
    /// ping; call this to account for it.
    pub fn on_activity(&mut self) {
        self.last_ping = Some(Instant::now());
        self.consecutive_failures = 0;
    }

    /// True once `max_failures` consecutive pings have failed.
    pub fn is_connection_failed(&self) -> bool {
        self.consecutive_failures >= self.config.max_failures
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ping_is_due_immediately() {
        let manager = KeepAliveManager::new(KeepAliveConfig::new(Duration::from_millis(50)));
        assert!(manager.should_ping());
    }

    #[test]
    fn interval_gates_the_next_ping() {
        let mut manager = KeepAliveManager::new(KeepAliveConfig::new(Duration::from_millis(50)));
        manager.on_ping_sent();
        assert!(!manager.should_ping());

        std::thread::sleep(Duration::from_millis(70));
        assert!(manager.should_ping());
    }

    #[test]
    fn failures_accumulate_until_limit() {
        let mut manager =
            KeepAliveManager::new(KeepAliveConfig::new(Duration::from_millis(1)).with_max_failures(2));

        manager.on_ping_failure();
        assert!(!manager.is_connection_failed());

        manager.on_ping_failure();
        assert!(manager.is_connection_failed());
        assert!(!manager.should_ping());

        manager.on_ping_success();
        assert!(!manager.is_connection_failed());
    }

    #[test]
    fn activity_counts_as_a_ping() {
        let mut manager = KeepAliveManager::new(KeepAliveConfig::new(Duration::from_secs(60)));
        manager.on_activity();
        assert!(!manager.should_ping());
    }

    #[test]
    fn disabled_manager_never_pings() {
        let manager = KeepAliveManager::new(KeepAliveConfig::disabled());
        assert!(!manager.should_ping());
    }
}
