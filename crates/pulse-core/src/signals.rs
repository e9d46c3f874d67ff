//! Implicit-feedback accumulator.
//!
//! Tracks behavior-derived quality signals over one session: retries,
//! compactions, error kinds, and whether the user walked away mid-turn.
//! Pure in-memory state machine; the projection to [`SessionSignals`]
//! happens once at session end.

use crate::session::{FinalState, SessionSignals};
use std::collections::BTreeSet;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Idle,
    TurnInProgress,
}

/// Per-session accumulator of implicit feedback.
#[derive(Debug)]
pub struct SignalTracker {
    state: TrackerState,
    turn_started_at: Option<Instant>,
    retry_count: u32,
    compaction_count: u32,
    error_kinds: BTreeSet<String>,
}

impl SignalTracker {
    pub fn new() -> Self {
        Self {
            state: TrackerState::Idle,
            turn_started_at: None,
            retry_count: 0,
            compaction_count: 0,
            error_kinds: BTreeSet::new(),
        }
    }

    /// Clear all accumulated state for a new session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn start_turn(&mut self) {
        self.state = TrackerState::TurnInProgress;
        self.turn_started_at = Some(Instant::now());
    }

    pub fn end_turn(&mut self) {
        self.state = TrackerState::Idle;
        self.turn_started_at = None;
    }

    pub fn is_turn_in_progress(&self) -> bool {
        self.state == TrackerState::TurnInProgress
    }

    /// When the in-progress turn started, if any.
    pub fn turn_started_at(&self) -> Option<Instant> {
        self.turn_started_at
    }

    /// Valid in either state.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Valid in either state.
    pub fn record_compaction(&mut self) {
        self.compaction_count += 1;
    }

    /// Record an error kind. Duplicate kinds collapse (set semantics).
    pub fn record_error(&mut self, kind: &str) {
        self.error_kinds.insert(kind.to_string());
    }

    /// Project the accumulated state into the final signals.
    ///
    /// `error` takes precedence over `abandoned`: a session that errored and
    /// was then abandoned reports `error`.
    pub fn signals(&self, explicitly_ended: bool) -> SessionSignals {
        let abandoned_mid_turn = self.is_turn_in_progress();
        let final_state = if !self.error_kinds.is_empty() {
            FinalState::Error
        } else if abandoned_mid_turn || !explicitly_ended {
            FinalState::Abandoned
        } else {
            FinalState::Completed
        };
        SessionSignals {
            retry_count: self.retry_count,
            compaction_count: self.compaction_count,
            abandoned_mid_turn,
            final_state,
            error_kinds: self.error_kinds.iter().cloned().collect(),
        }
    }
}

impl Default for SignalTracker {
    fn default() -> Self {
        Self::new()
    }
}
