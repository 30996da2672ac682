//! Per-peer reconnection state machine.
//!
//! Transitions are pure functions of the current state and a caller-supplied
//! `now`, so backoff and jitter are testable without sockets or timers.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;

use super::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Connecting,
    Connected,
    /// Waiting out a failed dial. `attempt` counts consecutive failures.
    Backoff { until: Instant, attempt: u32 },
}

impl ReconnectState {
    /// Marks a dial as started. Returns `None` if a dial is not allowed now.
    #[must_use]
    pub fn begin_dial(self, now: Instant) -> Option<Self> {
        self.ready_to_dial(now).then_some(Self::Connecting)
    }

    #[must_use]
    pub fn on_connected(self) -> Self {
        Self::Connected
    }

    /// Records a failed dial, scheduling the next attempt after `delay`.
    #[must_use]
    pub fn on_failed(self, now: Instant, delay: Duration) -> Self {
        Self::Backoff {
            until: now + delay,
            attempt: self.failures() + 1,
        }
    }

    /// A clean close makes the peer immediately eligible again.
    #[must_use]
    pub fn on_closed(self) -> Self {
        Self::Idle
    }

    #[must_use]
    pub fn ready_to_dial(self, now: Instant) -> bool {
        match self {
            Self::Idle => true,
            Self::Connecting | Self::Connected => false,
            Self::Backoff { until, .. } => now >= until,
        }
    }

    /// Consecutive failed dials so far.
    #[must_use]
    pub fn failures(self) -> u32 {
        match self {
            Self::Backoff { attempt, .. } => attempt,
            _ => 0,
        }
    }
}

/// Delay before retrying after `attempt` consecutive failures (1-based),
/// before jitter: `base * 2^(attempt-1)`, capped at `max`.
#[must_use]
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    config
        .base_delay
        .saturating_mul(1 << exponent)
        .min(config.max_delay)
}

/// Scales `delay` by a factor in `[1 - jitter, 1 + jitter]`.
#[must_use]
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, jitter: f64, rng: &mut R) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let factor = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

/// Reconnection state for every peer this node dials.
#[derive(Debug)]
pub struct ReconnectTracker {
    config: ReconnectConfig,
    states: DashMap<String, ReconnectState>,
}

impl ReconnectTracker {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self, peer: &str) -> ReconnectState {
        self.states
            .get(peer)
            .map_or(ReconnectState::Idle, |entry| *entry.value())
    }

    /// Atomically moves `peer` to `Connecting` if it may be dialed now.
    pub fn try_begin(&self, peer: &str, now: Instant) -> bool {
        let mut entry = self
            .states
            .entry(peer.to_string())
            .or_insert(ReconnectState::Idle);
        match entry.begin_dial(now) {
            Some(next) => {
                *entry = next;
                true
            }
            None => false,
        }
    }

    pub fn connected(&self, peer: &str) {
        self.states
            .insert(peer.to_string(), ReconnectState::Connected);
    }

    /// Records a failed dial and returns the jittered delay applied.
    pub fn failed(&self, peer: &str, now: Instant) -> Duration {
        let mut entry = self
            .states
            .entry(peer.to_string())
            .or_insert(ReconnectState::Idle);
        let attempt = entry.failures() + 1;
        let delay = apply_jitter(
            backoff_delay(&self.config, attempt),
            self.config.jitter,
            &mut rand::rng(),
        );
        *entry = entry.on_failed(now, delay);
        delay
    }

    pub fn closed(&self, peer: &str) {
        if let Some(mut entry) = self.states.get_mut(peer) {
            *entry = entry.on_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.0,
        }
    }

    #[test]
    fn idle_peer_can_dial() {
        let now = Instant::now();
        assert_eq!(
            ReconnectState::Idle.begin_dial(now),
            Some(ReconnectState::Connecting)
        );
        assert_eq!(ReconnectState::Connecting.begin_dial(now), None);
        assert_eq!(ReconnectState::Connected.begin_dial(now), None);
    }

    #[test]
    fn backoff_blocks_until_deadline() {
        let now = Instant::now();
        let state = ReconnectState::Connecting.on_failed(now, Duration::from_secs(1));
        assert_eq!(state.failures(), 1);
        assert!(!state.ready_to_dial(now));
        assert!(state.ready_to_dial(now + Duration::from_secs(1)));

        let again = state.on_failed(now, Duration::from_secs(1));
        assert_eq!(again.failures(), 2);
    }

    #[test]
    fn success_and_close_reset_failures() {
        let now = Instant::now();
        let state = ReconnectState::Idle
            .on_failed(now, Duration::ZERO)
            .on_connected();
        assert_eq!(state, ReconnectState::Connected);
        assert_eq!(state.on_closed(), ReconnectState::Idle);
        assert_eq!(state.failures(), 0);
    }

    #[test]
    fn delay_doubles_and_caps() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn tracker_walks_the_state_machine() {
        let tracker = ReconnectTracker::new(config());
        let now = Instant::now();

        assert!(tracker.try_begin("orders", now));
        assert!(!tracker.try_begin("orders", now));

        let delay = tracker.failed("orders", now);
        assert_eq!(delay, Duration::from_millis(100));
        assert!(!tracker.try_begin("orders", now));
        assert!(tracker.try_begin("orders", now + delay));

        let delay = tracker.failed("orders", now);
        assert_eq!(delay, Duration::from_millis(200));

        tracker.connected("orders");
        assert_eq!(tracker.state("orders"), ReconnectState::Connected);
        tracker.closed("orders");
        assert_eq!(tracker.state("orders"), ReconnectState::Idle);
    }

    proptest! {
        #[test]
        fn jitter_stays_in_band(millis in 1u64..60_000, jitter in 0.0f64..1.0, seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let delay = Duration::from_millis(millis);
            let jittered = apply_jitter(delay, jitter, &mut rng);
            let low = delay.mul_f64(1.0 - jitter);
            let high = delay.mul_f64(1.0 + jitter);
            // mul_f64 rounds to the nanosecond.
            prop_assert!(jittered + Duration::from_nanos(1) >= low);
            prop_assert!(jittered <= high + Duration::from_nanos(1));
        }
    }
}
