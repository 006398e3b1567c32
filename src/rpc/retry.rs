use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::core::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub multiplier: f64,
    pub jitter: bool,
    pub circuit_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            max_retries: config.max_retries,
            multiplier: config.multiplier,
            jitter: config.jitter,
            circuit_timeout: config.circuit_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// The wait was interrupted by the shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Exponential backoff with a time-boxed circuit breaker.
///
/// Holds plain mutable state: it belongs to exactly one task and is never shared.
#[derive(Debug)]
pub struct RetrySupervisor {
    policy: RetryPolicy,
    attempt: u32,
    circuit_open: bool,
    circuit_opened_at: Option<Instant>,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            circuit_open: false,
            circuit_opened_at: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }

    /// False while the circuit is open. Opens it once the retry budget is spent,
    /// and closes it again (attempt = 0) after the circuit timeout.
    pub fn should_retry(&mut self) -> bool {
        if self.circuit_open {
            let elapsed = self
                .circuit_opened_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if elapsed < self.policy.circuit_timeout {
                return false;
            }
            debug!("Circuit timeout elapsed, closing circuit");
            self.reset();
        }

        if self.attempt >= self.policy.max_retries {
            self.open_circuit();
            return false;
        }
        true
    }

    /// Delay before the next attempt.
    pub fn next_delay(&self) -> Duration {
        self.delay_for_attempt(self.attempt)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.policy.initial_delay.as_secs_f64();
        let max = self.policy.max_delay.as_secs_f64();
        let mut delay = if attempt == 0 {
            initial
        } else {
            initial * self.policy.multiplier.powi(attempt as i32)
        };
        if !delay.is_finite() || delay > max {
            delay = max;
        }
        if self.policy.jitter {
            delay *= rand::thread_rng().gen_range(0.5..=1.0);
        }
        Duration::from_secs_f64(delay)
    }

    /// Time left until an open circuit may close. Zero when closed.
    pub fn circuit_remaining(&self) -> Duration {
        match (self.circuit_open, self.circuit_opened_at) {
            (true, Some(at)) => self.policy.circuit_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Sleep for the next delay, then count the attempt.
    pub async fn wait(&mut self, shutdown: &Shutdown) -> Result<(), Cancelled> {
        let delay = self.next_delay();
        debug!(attempt = self.attempt, ?delay, "Waiting before retry");
        tokio::select! {
            _ = shutdown.cancelled() => return Err(Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        self.attempt += 1;
        Ok(())
    }

    /// Sleep until an open circuit may close.
    pub async fn wait_circuit(&self, shutdown: &Shutdown) -> Result<(), Cancelled> {
        let remaining = self.circuit_remaining();
        tokio::select! {
            _ = shutdown.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(remaining) => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.circuit_open = false;
        self.circuit_opened_at = None;
    }

    pub fn open_circuit(&mut self) {
        if !self.circuit_open {
            warn!(
                attempts = self.attempt,
                timeout = ?self.policy.circuit_timeout,
                "Retry budget exhausted, opening circuit"
            );
        }
        self.circuit_open = true;
        self.circuit_opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown;

    fn policy(jitter: bool, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries,
            multiplier: 2.0,
            jitter,
            circuit_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn backoff_sequence() {
        let supervisor = RetrySupervisor::new(policy(false, 10));
        let delays: Vec<u64> = (0..7)
            .map(|attempt| supervisor.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jitter_stays_in_band() {
        let supervisor = RetrySupervisor::new(policy(true, 10));
        for _ in 0..200 {
            let delay = supervisor.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(1), "{delay:?} below band");
            assert!(delay <= Duration::from_secs(2), "{delay:?} above band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_advances_attempt() {
        let (_trigger, shutdown) = shutdown::channel();
        let mut supervisor = RetrySupervisor::new(policy(false, 10));
        assert_eq!(supervisor.next_delay(), Duration::from_secs(1));
        supervisor.wait(&shutdown).await.unwrap();
        supervisor.wait(&shutdown).await.unwrap();
        assert_eq!(supervisor.attempt(), 2);
        assert_eq!(supervisor.next_delay(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_and_recovers() {
        let (_trigger, shutdown) = shutdown::channel();
        let mut supervisor = RetrySupervisor::new(policy(false, 3));

        for _ in 0..3 {
            assert!(supervisor.should_retry());
            supervisor.wait(&shutdown).await.unwrap();
        }
        // Fourth consecutive failure.
        assert!(!supervisor.should_retry());
        assert!(supervisor.is_circuit_open());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!supervisor.should_retry());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(supervisor.should_retry());
        assert_eq!(supervisor.attempt(), 0);
        assert!(!supervisor.is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_cancellable() {
        let (trigger, shutdown) = shutdown::channel();
        let mut supervisor = RetrySupervisor::new(policy(false, 10));
        trigger.trigger();
        assert_eq!(supervisor.wait(&shutdown).await, Err(Cancelled));
        assert_eq!(supervisor.attempt(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut supervisor = RetrySupervisor::new(policy(false, 0));
        assert!(!supervisor.should_retry());
        assert!(supervisor.is_circuit_open());
        supervisor.reset();
        assert_eq!(supervisor.attempt(), 0);
        assert!(!supervisor.is_circuit_open());
        assert_eq!(supervisor.circuit_remaining(), Duration::ZERO);
    }
}
