//! Reconnection policy.
//!
//! The policy is a pure decision: given the state the link was in, why it
//! went away, and how many automatic attempts have already been made since
//! the last time the connection was Ready, it says whether to try again and
//! after how long. Scheduling and cancelling the timer is the actor's job.

use std::time::Duration;

use crate::ble::connection::ConnectionState;
use crate::error::{Error, Result};

/// Why a link went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectCause {
    /// The caller asked for the disconnect.
    Requested,
    /// Peer-initiated disconnect, link loss, or a failed automatic attempt.
    Unsolicited,
}

/// What to do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule one connect attempt after `delay`.
    Reconnect {
        /// Time to wait before connecting.
        delay: Duration,
        /// 1-based number of the attempt being scheduled.
        attempt: u32,
    },
    /// Stay disconnected.
    Stop,
}

/// Options for automatic reconnection.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Delay before the first attempt after a disconnect.
    pub delay: Duration,
    /// Maximum attempts per disconnect chain (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Growth factor applied per failed attempt. 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay once backoff is applied.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    /// One attempt 5 seconds after every unsolicited disconnect, forever.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with a fixed delay and no attempt limit.
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            ..Default::default()
        }
    }

    /// Create a policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Set maximum number of reconnection attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Remove the attempt limit.
    pub fn unlimited(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set exponential backoff, capped at `max_delay`.
    pub fn backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Delay for the attempt that follows `attempts_made` earlier ones.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.delay;
        }

        let factor = self.backoff_multiplier.powi(attempts_made.min(i32::MAX as u32) as i32);
        let delay_ms = self.delay.as_millis() as f64 * factor;
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64).max(self.delay)
    }

    /// Decide whether to reconnect.
    ///
    /// Only links that had been asked to connect (Connecting, Discovering or
    /// Ready) and that went away unsolicited are eligible.
    pub fn decide(
        &self,
        previous: ConnectionState,
        cause: DisconnectCause,
        attempts_made: u32,
    ) -> ReconnectDecision {
        if cause == DisconnectCause::Requested || !previous.is_connecting_or_connected() {
            return ReconnectDecision::Stop;
        }

        if let Some(max) = self.max_attempts {
            if attempts_made >= max {
                return ReconnectDecision::Stop;
            }
        }

        ReconnectDecision::Reconnect {
            delay: self.delay_for_attempt(attempts_made),
            attempt: attempts_made.saturating_add(1),
        }
    }

    /// Validate the options and return an error if invalid.
    ///
    /// Checks that:
    /// - `backoff_multiplier` is a finite number >= 1.0
    /// - `delay` is > 0
    /// - `max_delay` >= `delay`
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.delay.is_zero() {
            return Err(Error::InvalidConfig("delay must be > 0".to_string()));
        }
        if self.max_delay < self.delay {
            return Err(Error::InvalidConfig(
                "max_delay must be >= delay".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_is_fixed_five_seconds_forever() {
        let policy = ReconnectPolicy::default();
        for attempts in [0, 1, 10, 1000] {
            assert_eq!(
                policy.decide(ConnectionState::Ready, DisconnectCause::Unsolicited, attempts),
                ReconnectDecision::Reconnect {
                    delay: Duration::from_secs(5),
                    attempt: attempts + 1,
                }
            );
        }
    }

    #[test]
    fn test_requested_disconnect_never_reconnects() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.decide(ConnectionState::Ready, DisconnectCause::Requested, 0),
            ReconnectDecision::Stop
        );
    }

    #[test]
    fn test_only_connection_states_are_eligible() {
        let policy = ReconnectPolicy::default();
        for state in [
            ConnectionState::Idle,
            ConnectionState::Scanning,
            ConnectionState::ReconnectPending,
        ] {
            assert_eq!(
                policy.decide(state, DisconnectCause::Unsolicited, 0),
                ReconnectDecision::Stop
            );
        }
        assert!(matches!(
            policy.decide(ConnectionState::Discovering, DisconnectCause::Unsolicited, 0),
            ReconnectDecision::Reconnect { .. }
        ));
    }

    #[test]
    fn test_max_attempts() {
        let policy = ReconnectPolicy::default().max_attempts(2);
        let decide = |n| policy.decide(ConnectionState::Connecting, DisconnectCause::Unsolicited, n);

        assert!(matches!(decide(0), ReconnectDecision::Reconnect { attempt: 1, .. }));
        assert!(matches!(decide(1), ReconnectDecision::Reconnect { attempt: 2, .. }));
        assert_eq!(decide(2), ReconnectDecision::Stop);
        assert_eq!(
            ReconnectPolicy::disabled().decide(
                ConnectionState::Ready,
                DisconnectCause::Unsolicited,
                0
            ),
            ReconnectDecision::Stop
        );
    }

    #[test]
    fn test_backoff() {
        let policy = ReconnectPolicy::fixed_delay(Duration::from_secs(1))
            .backoff(2.0, Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectPolicy::default().validate().is_ok());
        assert!(ReconnectPolicy::default()
            .backoff(0.5, Duration::from_secs(5))
            .validate()
            .is_err());
        assert!(ReconnectPolicy::fixed_delay(Duration::ZERO).validate().is_err());
        assert!(ReconnectPolicy::fixed_delay(Duration::from_secs(5))
            .backoff(2.0, Duration::from_secs(1))
            .validate()
            .is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_stays_within_bounds(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..100_000,
            multiplier in 1.0f64..4.0,
            attempts in 0u32..64,
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = base + Duration::from_millis(extra_ms);
            let policy = ReconnectPolicy::fixed_delay(base).backoff(multiplier, cap);

            let delay = policy.delay_for_attempt(attempts);
            prop_assert!(delay >= base);
            prop_assert!(delay <= cap);
        }

        #[test]
        fn prop_delay_never_shrinks(attempts in 0u32..32, multiplier in 1.0f64..3.0) {
            let policy = ReconnectPolicy::fixed_delay(Duration::from_millis(100))
                .backoff(multiplier, Duration::from_secs(60));
            prop_assert!(policy.delay_for_attempt(attempts + 1) >= policy.delay_for_attempt(attempts));
        }
    }
}
