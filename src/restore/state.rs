// pgvault/src/restore/state.rs
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{OrchestratorError, Result};

/// Lifecycle of one restore operation.
///
/// `Pending → Validating → (Cleaning) → Applying → Committed | Failed`.
/// `Failed` is reachable from every non-terminal state after `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreState {
    Pending,
    Validating,
    Cleaning,
    Applying,
    Committed,
    Failed,
}

impl RestoreState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RestoreState::Committed | RestoreState::Failed)
    }

    pub fn can_transition_to(self, next: RestoreState) -> bool {
        use RestoreState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Cleaning)
                | (Validating, Applying)
                | (Validating, Failed)
                | (Cleaning, Applying)
                | (Cleaning, Failed)
                | (Applying, Committed)
                | (Applying, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: RestoreState,
    pub at: DateTime<Utc>,
}

/// Transition log of a single restore. There is no way back out of a
/// terminal state: a failed restore is re-run as a new operation.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOperation {
    history: Vec<StateChange>,
}

impl Default for RestoreOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreOperation {
    pub fn new() -> Self {
        Self {
            history: vec![StateChange {
                state: RestoreState::Pending,
                at: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> RestoreState {
        self.history
            .last()
            .map(|change| change.state)
            .unwrap_or(RestoreState::Pending)
    }

    pub fn advance(&mut self, next: RestoreState) -> Result<()> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(OrchestratorError::IllegalTransition { from, to: next });
        }
        self.history.push(StateChange { state: next, at: Utc::now() });
        Ok(())
    }

    pub fn states(&self) -> Vec<RestoreState> {
        self.history.iter().map(|change| change.state).collect()
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }
}
