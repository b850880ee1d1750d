//! Refresh scheduler state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The refresh loop executes the I/O implied by each action.
//!
//! ```text
//! Initializing --Fetched--> Waiting --TimerElapsed--> Refreshing
//!      |                       ^                          |
//!  FetchFailed                 +--Fetched / FetchFailed*--+
//!      v                                                  |
//!  Terminated <-------- FetchFailed (no retry) -----------+
//! ```
//!
//! `*` only when retry on failure is enabled. `Cancelled` moves any state to
//! `Terminated`.

use std::time::{Duration, SystemTime};

use crate::config::RefreshConfig;
use crate::schedule;

/// Inputs to the state machine that come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub refresh_percentage: u8,
    pub retry_on_failure: bool,
    pub retry_interval: Duration,
}

impl From<&RefreshConfig> for SchedulePolicy {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            refresh_percentage: config.refresh_percentage,
            retry_on_failure: config.retry_on_failure,
            retry_interval: config.retry_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Mandatory first fetch during construction
    Initializing,
    /// Sleeping until the next refresh
    Waiting { delay: Duration },
    /// Credential client call in flight
    Refreshing,
    /// Loop has exited; no further refreshes
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Credential client returned a token expiring at `expires_on`
    Fetched {
        expires_on: SystemTime,
        now: SystemTime,
    },
    /// Credential client failed
    FetchFailed,
    /// Waiting delay elapsed
    TimerElapsed,
    /// Shutdown requested
    Cancelled,
}

/// Actions the refresh loop should execute after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Sleep, then report `TimerElapsed`
    Sleep(Duration),
    /// Call the credential client
    Fetch,
    /// Fail construction; the loop never starts
    AbortConstruction,
    /// Exit the loop
    Stop,
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    policy: &SchedulePolicy,
    state: SchedulerState,
    event: SchedulerEvent,
) -> (SchedulerState, SchedulerAction) {
    match (state, event) {
        (_, SchedulerEvent::Cancelled) => (SchedulerState::Terminated, SchedulerAction::Stop),

        // --- Fetch results ---
        (
            SchedulerState::Initializing | SchedulerState::Refreshing,
            SchedulerEvent::Fetched { expires_on, now },
        ) => {
            let delay = schedule::refresh_delay(now, expires_on, policy.refresh_percentage);
            (
                SchedulerState::Waiting { delay },
                SchedulerAction::Sleep(delay),
            )
        }

        (SchedulerState::Initializing, SchedulerEvent::FetchFailed) => (
            SchedulerState::Terminated,
            SchedulerAction::AbortConstruction,
        ),

        (SchedulerState::Refreshing, SchedulerEvent::FetchFailed) if policy.retry_on_failure => (
            SchedulerState::Waiting {
                delay: policy.retry_interval,
            },
            SchedulerAction::Sleep(policy.retry_interval),
        ),

        (SchedulerState::Refreshing, SchedulerEvent::FetchFailed) => {
            (SchedulerState::Terminated, SchedulerAction::Stop)
        }

        // --- Waiting ---
        (SchedulerState::Waiting { .. }, SchedulerEvent::TimerElapsed) => {
            (SchedulerState::Refreshing, SchedulerAction::Fetch)
        }

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, SchedulerAction::None),
    }
}
