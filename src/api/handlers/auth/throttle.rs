//! Per-client login throttle with exponential lockout.
//!
//! Up to [`FAILURE_THRESHOLD`] failures are free. Every failure beyond that
//! locks the client out for `BASE_LOCKOUT * 2^(failures - 6)`, with the
//! exponent capped at [`MAX_EXPONENT`]. State lives only in memory and is
//! cleared by a successful login.
//!
//! An attempt is counted as a failure when it starts, under the same lock
//! that checks for a lockout, so concurrent attempts cannot all slip past the
//! check before the first of them is recorded. A success resets the client;
//! an attempt that ended in a store fault hands its reservation back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

pub const FAILURE_THRESHOLD: u32 = 5;
pub const BASE_LOCKOUT: Duration = Duration::from_secs(30);
pub const MAX_EXPONENT: u32 = 10;
pub const DEFAULT_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    Open,
    Locked { remaining: Duration },
}

/// Outcome of [`LoginThrottle::begin_attempt`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    /// Counted in advance; `lockout` is already in force if non-zero and is
    /// what the caller reports should the credentials turn out wrong.
    Reserved { lockout: Duration },
    /// Refused without consulting the credentials.
    Locked { remaining: Duration },
}

#[derive(Debug)]
struct AttemptState {
    failures: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

#[derive(Debug, Default)]
pub struct LoginThrottle {
    attempts: Mutex<HashMap<String, AttemptState>>,
}

impl LoginThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<String, AttemptState>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lockout window for the given consecutive failure count, zero while
    /// under the threshold.
    #[must_use]
    pub fn lockout_window(failures: u32) -> Duration {
        if failures <= FAILURE_THRESHOLD {
            return Duration::ZERO;
        }
        let exponent = (failures - FAILURE_THRESHOLD - 1).min(MAX_EXPONENT);
        BASE_LOCKOUT.saturating_mul(1 << exponent)
    }

    pub fn check_lock(&self, client: &str) -> LockStatus {
        self.check_lock_at(client, Instant::now())
    }

    pub(crate) fn check_lock_at(&self, client: &str, now: Instant) -> LockStatus {
        let mut attempts = self.attempts();
        match attempts.get_mut(client) {
            Some(state) => Self::lock_status(state, now),
            None => LockStatus::Open,
        }
    }

    fn lock_status(state: &mut AttemptState, now: Instant) -> LockStatus {
        match state.locked_until {
            Some(until) if until > now => LockStatus::Locked {
                remaining: until - now,
            },
            Some(_) => {
                // Expired lockouts are cleared; the failure count is kept so
                // the next failure escalates.
                state.locked_until = None;
                LockStatus::Open
            }
            None => LockStatus::Open,
        }
    }

    /// Check the lockout and, if open, count this attempt as a failure.
    pub fn begin_attempt(&self, client: &str) -> Attempt {
        self.begin_attempt_at(client, Instant::now())
    }

    pub(crate) fn begin_attempt_at(&self, client: &str, now: Instant) -> Attempt {
        let mut attempts = self.attempts();
        let state = attempts
            .entry(client.to_string())
            .or_insert_with(|| AttemptState {
                failures: 0,
                locked_until: None,
                last_failure: now,
            });
        if let LockStatus::Locked { remaining } = Self::lock_status(state, now) {
            return Attempt::Locked { remaining };
        }
        Attempt::Reserved {
            lockout: Self::count_failure(state, now),
        }
    }

    fn count_failure(state: &mut AttemptState, now: Instant) -> Duration {
        state.failures = state.failures.saturating_add(1);
        state.last_failure = now;
        let window = Self::lockout_window(state.failures);
        if !window.is_zero() {
            state.locked_until = now.checked_add(window);
        }
        window
    }

    /// Count a failed attempt and return the lockout it triggered, if any.
    pub fn record_failure(&self, client: &str) -> Duration {
        self.record_failure_at(client, Instant::now())
    }

    pub(crate) fn record_failure_at(&self, client: &str, now: Instant) -> Duration {
        let mut attempts = self.attempts();
        let state = attempts
            .entry(client.to_string())
            .or_insert_with(|| AttemptState {
                failures: 0,
                locked_until: None,
                last_failure: now,
            });
        Self::count_failure(state, now)
    }

    /// Hand back a reservation whose outcome says nothing about the
    /// credentials, lifting the lockout it imposed.
    pub fn release(&self, client: &str, lockout: Duration) {
        let mut attempts = self.attempts();
        let Some(state) = attempts.get_mut(client) else {
            return;
        };
        state.failures = state.failures.saturating_sub(1);
        if !lockout.is_zero() {
            state.locked_until = None;
        }
        if state.failures == 0 && state.locked_until.is_none() {
            attempts.remove(client);
        }
    }

    pub fn reset(&self, client: &str) {
        self.attempts().remove(client);
    }

    /// Drop unlocked entries whose last failure is older than `idle`.
    pub fn sweep(&self, idle: Duration) -> usize {
        self.sweep_at(idle, Instant::now())
    }

    pub(crate) fn sweep_at(&self, idle: Duration, now: Instant) -> usize {
        let mut attempts = self.attempts();
        let before = attempts.len();
        attempts.retain(|_, state| {
            let locked = state.locked_until.is_some_and(|until| until > now);
            locked || now.saturating_duration_since(state.last_failure) < idle
        });
        before - attempts.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = self.sweep(idle);
                if removed > 0 {
                    debug!("Login throttle dropped {removed} idle clients");
                }
            }
        })
    }

    #[must_use]
    pub fn failures(&self, client: &str) -> u32 {
        self.attempts().get(client).map_or(0, |state| state.failures)
    }
}
