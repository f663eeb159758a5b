//! Pipeline checkpoints.

use super::ActionType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The macro-steps of a privacy request pipeline, in execution order.
///
/// A stored checkpoint names the most recently *completed* step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineCheckpoint {
    /// Pre-execution webhooks.
    PreWebhooks,
    /// Access graph execution.
    Access,
    /// Consent propagation.
    Consent,
    /// Erasure graph execution.
    Erasure,
    /// Erasure cleanup (secret disposal).
    FinalizeErasure,
    /// Post-execution webhooks.
    PostWebhooks,
    /// Pipeline finished.
    Done,
}

impl PipelineCheckpoint {
    /// All checkpoints in order.
    pub const ALL: [Self; 7] = [
        Self::PreWebhooks,
        Self::Access,
        Self::Consent,
        Self::Erasure,
        Self::FinalizeErasure,
        Self::PostWebhooks,
        Self::Done,
    ];

    /// Returns the step after this one.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| *step > self)
    }

    /// Returns the steps still to run after `completed`.
    #[must_use]
    pub fn remaining_after(completed: Option<Self>) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|step| completed.map_or(true, |done| *step > done))
            .collect()
    }

    /// Returns the action this step executes, if it is a graph step.
    #[must_use]
    pub fn action(self) -> Option<ActionType> {
        match self {
            Self::Access => Some(ActionType::Access),
            Self::Consent => Some(ActionType::Consent),
            Self::Erasure => Some(ActionType::Erasure),
            _ => None,
        }
    }

    /// Returns the graph step for an action.
    #[must_use]
    pub fn for_action(action: ActionType) -> Self {
        match action {
            ActionType::Access => Self::Access,
            ActionType::Consent => Self::Consent,
            ActionType::Erasure => Self::Erasure,
        }
    }
}

impl fmt::Display for PipelineCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreWebhooks => "pre_webhooks",
            Self::Access => "access",
            Self::Consent => "consent",
            Self::Erasure => "erasure",
            Self::FinalizeErasure => "finalize_erasure",
            Self::PostWebhooks => "post_webhooks",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}
