//! Alert state machine behind the tray indicator.
//!
//! | state \ event      | CheckStarted | Succeeded(0) | Succeeded(n>0)      | Failed            | UserCleared |
//! |--------------------|--------------|--------------|---------------------|-------------------|-------------|
//! | Idle               | Checking     | -            | -                   | -                 | -           |
//! | Checking           | -            | Idle         | UpdatesAvailable(n) | state before check| - (1)       |
//! | UpdatesAvailable(k)| Checking     | -            | -                   | -                 | Idle        |
//!
//! "-" leaves the state unchanged. (1) A clear during a check stays `Checking`
//! but makes `Idle` the state a failed check falls back to.
//!
//! How the indicator flashes is a pure function of the state and how long the
//! machine has been in it; renderers sample [`AlertStateMachine::indicator`].

use chrono::{DateTime, Utc};
use std::f64::consts::PI;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Flash cycle while a check is running.
pub const FLASH_CYCLE_FAST: Duration = Duration::from_millis(800);
/// Flash cycle while updates are waiting to be installed.
pub const FLASH_CYCLE_SLOW: Duration = Duration::from_secs(3);
/// How often the control loop resamples the indicator.
pub const FLASH_TICK: Duration = Duration::from_millis(50);

const TOOLTIP_PREFIX: &str = "YAY Update Notifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Idle,
    Checking,
    UpdatesAvailable(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    CheckStarted,
    CheckSucceeded(usize),
    /// Carries the human-readable failure reason.
    CheckFailed(String),
    UserCleared,
}

/// What a renderer needs to draw the tray icon at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Indicator {
    pub state: AlertState,
    /// Icon opacity in `[0.5, 1.0]`; 1.0 is solid.
    pub brightness: f32,
    pub tooltip: String,
}

/// Flash period for `state`, or `None` when the icon is solid.
pub fn flash_cycle(state: AlertState) -> Option<Duration> {
    match state {
        AlertState::Idle => None,
        AlertState::Checking => Some(FLASH_CYCLE_FAST),
        AlertState::UpdatesAvailable(_) => Some(FLASH_CYCLE_SLOW),
    }
}

/// Icon brightness after `elapsed` in `state`: a sine wave between 50% and 100%.
pub fn brightness(state: AlertState, elapsed: Duration) -> f32 {
    let Some(cycle) = flash_cycle(state) else {
        return 1.0;
    };
    let cycle = cycle.as_secs_f64();
    let phase = (elapsed.as_secs_f64() % cycle) / cycle;
    let sine = (2.0 * PI * phase).sin();
    (0.5 + 0.5 * (sine + 1.0) / 2.0) as f32
}

/// Extra text shown with the state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Note {
    None,
    Cleared,
    Failed(String),
}

/// Owns the one process-wide [`AlertState`]. Only the control loop mutates it.
#[derive(Debug)]
pub struct AlertStateMachine {
    state: AlertState,
    /// Where a failed check returns to.
    before_check: AlertState,
    since: Instant,
    since_wall: DateTime<Utc>,
    note: Note,
}

impl AlertStateMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            state: AlertState::Idle,
            before_check: AlertState::Idle,
            since: now,
            since_wall: Utc::now(),
            note: Note::None,
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    /// Wall-clock time the current state was entered.
    pub fn state_since(&self) -> DateTime<Utc> {
        self.since_wall
    }

    /// Last failure reason, cleared by the next successful check.
    pub fn last_error(&self) -> Option<&str> {
        match &self.note {
            Note::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Applies `event`. Returns true when the state changed.
    pub fn apply(&mut self, event: AlertEvent, now: Instant) -> bool {
        let next = match (self.state, event) {
            (AlertState::Idle | AlertState::UpdatesAvailable(_), AlertEvent::CheckStarted) => {
                self.before_check = self.state;
                AlertState::Checking
            }
            (AlertState::Checking, AlertEvent::CheckSucceeded(0)) => {
                self.note = Note::None;
                AlertState::Idle
            }
            (AlertState::Checking, AlertEvent::CheckSucceeded(count)) => {
                self.note = Note::None;
                AlertState::UpdatesAvailable(count)
            }
            (AlertState::Checking, AlertEvent::CheckFailed(reason)) => {
                self.note = Note::Failed(reason);
                self.before_check
            }
            (AlertState::UpdatesAvailable(_), AlertEvent::UserCleared) => {
                self.note = Note::Cleared;
                AlertState::Idle
            }
            (AlertState::Checking, AlertEvent::UserCleared) => {
                self.before_check = AlertState::Idle;
                self.note = Note::Cleared;
                AlertState::Checking
            }
            (state, event) => {
                debug!("Ignoring {event:?} in state {state:?}");
                state
            }
        };

        if next == self.state {
            return false;
        }
        info!("Alert state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.since = now;
        self.since_wall = Utc::now();
        true
    }

    /// Samples the indicator at `now`. Calling it twice at the same instant
    /// yields the same result.
    pub fn indicator(&self, now: Instant) -> Indicator {
        Indicator {
            state: self.state,
            brightness: brightness(self.state, now.saturating_duration_since(self.since)),
            tooltip: self.tooltip(),
        }
    }

    fn tooltip(&self) -> String {
        let body = match (self.state, &self.note) {
            (AlertState::Checking, _) => "Checking for updates...".to_string(),
            (AlertState::UpdatesAvailable(1), _) => "1 update available".to_string(),
            (AlertState::UpdatesAvailable(n), _) => format!("{n} updates available"),
            (AlertState::Idle, Note::Cleared) => "Alert cleared".to_string(),
            (AlertState::Idle, _) => "No updates available".to_string(),
        };
        match (&self.note, self.state) {
            (Note::Failed(reason), state) if state != AlertState::Checking => {
                format!("{TOOLTIP_PREFIX} - {body} (last check failed: {reason})")
            }
            _ => format!("{TOOLTIP_PREFIX} - {body}"),
        }
    }
}
