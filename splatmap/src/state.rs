//! Lifecycle of a staging attempt.
//!
//! ```text
//! created -> copying -> reconstructing -> reconstructed -> training -> trained -> gated -> merged
//!                  \             \                              \                   \-> rejected
//!                   \             \-> reconstruction_failed      \-> training_failed
//!                    \-> reconstruction_failed
//! ```
//!
//! Bootstrap attempts take the same path; their gate accepts automatically
//! once any image was recovered. Failure states are terminal and never retried
//! in place; a retry is a new attempt with a fresh staging dataset.

use chrono::{DateTime, Utc};
use common::id_type;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

use crate::catalog::GroupId;
use crate::error::{Error, Result};

id_type!(AttemptId);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptState {
    Created,
    Copying,
    Reconstructing,
    Reconstructed,
    ReconstructionFailed,
    Training,
    Trained,
    TrainingFailed,
    Gated,
    Merged,
    Rejected,
}

impl AttemptState {
    pub fn can_transition_to(self, to: AttemptState) -> bool {
        use AttemptState::*;

        matches!(
            (self, to),
            (Created, Copying)
                | (Copying, Reconstructing)
                // a staging set that cannot be assembled never reaches the engine
                | (Copying, ReconstructionFailed)
                | (Reconstructing, Reconstructed)
                | (Reconstructing, ReconstructionFailed)
                | (Reconstructed, Training)
                | (Training, Trained)
                | (Training, TrainingFailed)
                | (Trained, Gated)
                | (Gated, Merged)
                | (Gated, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::ReconstructionFailed
                | AttemptState::TrainingFailed
                | AttemptState::Merged
                | AttemptState::Rejected
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != AttemptState::Merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptKind {
    /// First batch of an environment; reconstructed alone and committed as
    /// the initial main dataset.
    Bootstrap,
    Expansion { base_group: GroupId },
}

impl AttemptKind {
    pub fn base_group(&self) -> Option<GroupId> {
        match self {
            AttemptKind::Bootstrap => None,
            AttemptKind::Expansion { base_group } => Some(*base_group),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: AttemptState,
    pub to: AttemptState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub kind: AttemptKind,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl Attempt {
    pub fn new(kind: AttemptKind) -> Self {
        Self {
            id: AttemptId::unique(),
            kind,
            state: AttemptState::Created,
            created_at: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Moves to `to`, appending to the history. Illegal moves leave the
    /// attempt untouched.
    pub fn advance(&mut self, to: AttemptState, note: Option<String>) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(attempt = %self.id, "Rejected transition {from} -> {to}");
            return Err(Error::InvalidTransition { from, to });
        }

        match &note {
            Some(note) => info!(attempt = %self.id, "{from} -> {to}: {note}"),
            None => info!(attempt = %self.id, "{from} -> {to}"),
        }

        self.history.push(Transition {
            from,
            to,
            at: Utc::now(),
            note,
        });
        self.state = to;

        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Note attached to the transition into the current state.
    pub fn last_note(&self) -> Option<&str> {
        self.history.last().and_then(|t| t.note.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    const HAPPY_PATH: [AttemptState; 7] = [
        AttemptState::Copying,
        AttemptState::Reconstructing,
        AttemptState::Reconstructed,
        AttemptState::Training,
        AttemptState::Trained,
        AttemptState::Gated,
        AttemptState::Merged,
    ];

    #[test]
    fn happy_path_reaches_merged() -> anyhow::Result<()> {
        let mut attempt = Attempt::new(AttemptKind::Bootstrap);
        for state in HAPPY_PATH {
            attempt.advance(state, None)?;
        }

        assert_eq!(attempt.state, AttemptState::Merged);
        assert!(attempt.is_terminal());
        assert_eq!(attempt.history.len(), HAPPY_PATH.len());
        assert_eq!(attempt.history[0].from, AttemptState::Created);
        Ok(())
    }

    #[test]
    fn no_transition_skips_a_state() {
        let mut attempt = Attempt::new(AttemptKind::Bootstrap);
        let result = attempt.advance(AttemptState::Reconstructing, None);

        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                from: AttemptState::Created,
                to: AttemptState::Reconstructing
            })
        ));
        assert_eq!(attempt.state, AttemptState::Created);
        assert!(attempt.history.is_empty());
    }

    #[test]
    fn terminal_states_have_no_exit() {
        use AttemptState::*;

        let all = [
            Created,
            Copying,
            Reconstructing,
            Reconstructed,
            ReconstructionFailed,
            Training,
            Trained,
            TrainingFailed,
            Gated,
            Merged,
            Rejected,
        ];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|to| !from.can_transition_to(*to)), "{from}");
        }
        assert!(ReconstructionFailed.is_failure());
        assert!(!Merged.is_failure());
    }

    #[test]
    fn failure_note_is_kept() -> anyhow::Result<()> {
        let mut attempt = Attempt::new(AttemptKind::Expansion {
            base_group: GroupId::new(2),
        });
        attempt.advance(AttemptState::Copying, None)?;
        attempt.advance(AttemptState::Reconstructing, None)?;
        attempt.advance(
            AttemptState::ReconstructionFailed,
            Some("mapper exited with status 1".to_string()),
        )?;

        assert_eq!(attempt.last_note(), Some("mapper exited with status 1"));
        assert_eq!(attempt.kind.base_group(), Some(GroupId::new(2)));
        Ok(())
    }

    #[test]
    fn state_names_are_snake_case() -> anyhow::Result<()> {
        assert_eq!(AttemptState::ReconstructionFailed.to_string(), "reconstruction_failed");
        assert_eq!(AttemptState::from_str("training_failed")?, AttemptState::TrainingFailed);

        let attempt = Attempt::new(AttemptKind::Expansion {
            base_group: GroupId::new(0),
        });
        let yaml = serde_yml::to_string(&attempt)?;
        assert!(yaml.contains("state: created"));
        assert!(yaml.contains("kind: expansion"));
        assert_eq!(serde_yml::from_str::<Attempt>(&yaml)?, attempt);
        Ok(())
    }
}
