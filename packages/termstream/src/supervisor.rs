//! Reconnection policy
//!
//! [`ConnectionSupervisor`] tracks transport errors on one subscription:
//! the first error degrades it, `threshold` errors with no gap longer than
//! `window` between them sever it. Successful deliveries never reset the
//! counter; only a quiet window does.
//!
//! [`ThrashGuard`] watches severs per client across resubscribes and flags
//! a session whose subscriptions are severed again right after coming back.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Healthy,
    Degraded,
    Severed,
}

#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    state: SupervisorState,
    errors: u32,
    last_error: Option<Instant>,
    window: Duration,
    threshold: u32,
}

impl ConnectionSupervisor {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            state: SupervisorState::Healthy,
            errors: 0,
            last_error: None,
            window,
            threshold: threshold.max(1),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.error_window, config.error_threshold)
    }

    /// Record one transport error and return the resulting state.
    pub fn record_error(&mut self, now: Instant) -> SupervisorState {
        if self.state == SupervisorState::Severed {
            return self.state;
        }
        self.expire(now);
        self.errors += 1;
        self.last_error = Some(now);
        self.state = if self.errors >= self.threshold {
            SupervisorState::Severed
        } else {
            SupervisorState::Degraded
        };
        self.state
    }

    /// Current state, after applying the quiet-window reset.
    pub fn state(&mut self, now: Instant) -> SupervisorState {
        self.expire(now);
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn last_error(&self) -> Option<Instant> {
        self.last_error
    }

    fn expire(&mut self, now: Instant) {
        if self.state != SupervisorState::Degraded {
            return;
        }
        if let Some(last) = self.last_error {
            if now.duration_since(last) >= self.window {
                self.errors = 0;
                self.state = SupervisorState::Healthy;
            }
        }
    }
}

/// Per-session record of recent severs, keyed by client id.
#[derive(Debug)]
pub struct ThrashGuard {
    window: Duration,
    last_sever: HashMap<String, Instant>,
}

impl ThrashGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sever: HashMap::new(),
        }
    }

    /// Record a sever of a subscription that was opened at `subscribed_at`.
    ///
    /// Returns `true` when the session is thrashing: this subscription was
    /// severed within the window of opening, and the same client's previous
    /// sever came within the window before it opened. Anonymous clients
    /// (empty id) cannot be matched across reconnects and never count.
    pub fn record_sever(&mut self, client_id: &str, subscribed_at: Instant, now: Instant) -> bool {
        if client_id.is_empty() {
            return false;
        }
        let previous = self.last_sever.insert(client_id.to_string(), now);
        let died_young = now.duration_since(subscribed_at) < self.window;
        let came_back_fast = previous.is_some_and(|prev| {
            subscribed_at >= prev && subscribed_at.duration_since(prev) < self.window
        });
        died_young && came_back_fast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_secs(5);

    fn supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(WINDOW, 3)
    }

    #[test]
    fn first_error_degrades() {
        let mut sup = supervisor();
        let t0 = Instant::now();
        assert_eq!(sup.state(t0), SupervisorState::Healthy);
        assert_eq!(sup.record_error(t0), SupervisorState::Degraded);
        assert_eq!(sup.error_count(), 1);
    }

    #[test]
    fn three_errors_within_window_sever() {
        let mut sup = supervisor();
        let t0 = Instant::now();
        sup.record_error(t0);
        sup.record_error(t0 + Duration::from_millis(700));
        assert_eq!(
            sup.record_error(t0 + Duration::from_secs(2)),
            SupervisorState::Severed
        );
    }

    #[test]
    fn quiet_window_resets() {
        let mut sup = supervisor();
        let t0 = Instant::now();
        sup.record_error(t0);
        sup.record_error(t0 + Duration::from_secs(1));
        assert_eq!(
            sup.state(t0 + Duration::from_secs(6)),
            SupervisorState::Healthy
        );
        assert_eq!(sup.error_count(), 0);
        assert_eq!(
            sup.record_error(t0 + Duration::from_secs(7)),
            SupervisorState::Degraded
        );
    }

    #[test]
    fn slow_errors_never_sever() {
        let mut sup = supervisor();
        let t0 = Instant::now();
        for i in 0..10 {
            let state = sup.record_error(t0 + Duration::from_secs(6 * i));
            assert_eq!(state, SupervisorState::Degraded);
        }
    }

    #[test]
    fn severed_is_terminal() {
        let mut sup = ConnectionSupervisor::new(WINDOW, 1);
        let t0 = Instant::now();
        assert_eq!(sup.record_error(t0), SupervisorState::Severed);
        assert_eq!(
            sup.state(t0 + Duration::from_secs(60)),
            SupervisorState::Severed
        );
    }

    #[test]
    fn first_sever_is_not_thrash() {
        let mut guard = ThrashGuard::new(WINDOW);
        let t0 = Instant::now();
        assert!(!guard.record_sever("c1", t0, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn quick_resever_is_thrash() {
        let mut guard = ThrashGuard::new(WINDOW);
        let t0 = Instant::now();
        let sever1 = t0 + Duration::from_secs(1);
        assert!(!guard.record_sever("c1", t0, sever1));
        let resub = sever1 + Duration::from_millis(200);
        assert!(guard.record_sever("c1", resub, resub + Duration::from_secs(1)));
    }

    #[test]
    fn stable_period_between_severs_is_not_thrash() {
        let mut guard = ThrashGuard::new(WINDOW);
        let t0 = Instant::now();
        let sever1 = t0 + Duration::from_secs(1);
        guard.record_sever("c1", t0, sever1);
        // Resubscribed fast but stayed up longer than the window
        let resub = sever1 + Duration::from_millis(100);
        assert!(!guard.record_sever("c1", resub, resub + Duration::from_secs(30)));
    }

    #[test]
    fn clients_are_tracked_separately() {
        let mut guard = ThrashGuard::new(WINDOW);
        let t0 = Instant::now();
        guard.record_sever("c1", t0, t0 + Duration::from_secs(1));
        let resub = t0 + Duration::from_secs(2);
        assert!(!guard.record_sever("c2", resub, resub + Duration::from_secs(1)));
    }

    #[test]
    fn anonymous_severs_are_never_thrash() {
        let mut guard = ThrashGuard::new(WINDOW);
        let t0 = Instant::now();
        let sever1 = t0 + Duration::from_secs(1);
        assert!(!guard.record_sever("", t0, sever1));
        let resub = sever1 + Duration::from_millis(200);
        assert!(!guard.record_sever("", resub, resub + Duration::from_secs(1)));
    }

    proptest! {
        #[test]
        fn successes_do_not_reset_counter(gaps in proptest::collection::vec(0u64..4999, 1..10)) {
            // Errors spaced under the window accumulate no matter what else happens
            let mut sup = supervisor();
            let mut now = Instant::now();
            let mut last = sup.record_error(now);
            for gap in gaps {
                now += Duration::from_millis(gap);
                last = sup.record_error(now);
            }
            prop_assert_eq!(last, if sup.error_count() >= 3 { SupervisorState::Severed } else { SupervisorState::Degraded });
        }

        #[test]
        fn severs_only_at_threshold(threshold in 1u32..8, errors in 1u32..12) {
            let mut sup = ConnectionSupervisor::new(WINDOW, threshold);
            let t0 = Instant::now();
            let mut state = SupervisorState::Healthy;
            for i in 0..errors {
                state = sup.record_error(t0 + Duration::from_millis(i as u64 * 10));
            }
            prop_assert_eq!(state == SupervisorState::Severed, errors >= threshold);
        }
    }
}
