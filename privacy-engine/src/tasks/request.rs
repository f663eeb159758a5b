//! Persisted privacy request records.

use super::artifacts::ArtifactRef;
use super::model::TaskErrorDetail;
use crate::connectors::ConsentPreference;
use crate::core::{ActionType, IdentitySeeds, PipelineCheckpoint, Policy, RequestStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Where a halted webhook step picks up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResumePoint {
    /// The webhook step that halted.
    pub checkpoint: PipelineCheckpoint,
    /// Index of the webhook to call next.
    pub next_index: usize,
}

/// A privacy request and its aggregate outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyRequest {
    /// Request id.
    pub id: Uuid,
    /// Policy deciding actions and masking.
    pub policy: Policy,
    /// Identity seeds supplied by the caller.
    pub identity: IdentitySeeds,
    /// Identity values added by webhooks.
    #[serde(default)]
    pub derived_identity: IdentitySeeds,
    /// Consent preferences to propagate.
    #[serde(default)]
    pub consent_preferences: Vec<ConsentPreference>,
    /// Aggregate status.
    #[serde(default)]
    pub status: RequestStatus,
    /// Actions with at least one failed task.
    #[serde(default)]
    pub failed_actions: BTreeSet<ActionType>,
    /// Failed task details.
    #[serde(default)]
    pub errors: Vec<TaskErrorDetail>,
    /// Set while waiting on a halting webhook.
    #[serde(default)]
    pub webhook_resume: Option<WebhookResumePoint>,
    /// Filtered access results.
    #[serde(default)]
    pub access_result: Option<ArtifactRef>,
    /// Cancellation flag, observed between dispatches.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Time the pipeline reached `done` or was canceled.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PrivacyRequest {
    /// Creates a pending request.
    #[must_use]
    pub fn new(policy: Policy, identity: IdentitySeeds) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            policy,
            identity,
            derived_identity: IdentitySeeds::new(),
            consent_preferences: Vec::new(),
            status: RequestStatus::Pending,
            failed_actions: BTreeSet::new(),
            errors: Vec::new(),
            webhook_resume: None,
            access_result: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Sets the consent preferences.
    #[must_use]
    pub fn with_consent_preferences(mut self, preferences: Vec<ConsentPreference>) -> Self {
        self.consent_preferences = preferences;
        self
    }

    /// Caller identity merged with webhook-derived identity. Caller values
    /// win on conflict.
    #[must_use]
    pub fn effective_identity(&self) -> IdentitySeeds {
        let mut merged = self.derived_identity.clone();
        merged.extend(self.identity.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Sets the status and touches `updated_at`.
    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if matches!(status, RequestStatus::Complete | RequestStatus::Canceled) {
            self.finished_at = Some(self.updated_at);
        }
    }

    /// True if the request was canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel_requested || self.status == RequestStatus::Canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_effective_identity_prefers_caller_values() {
        let mut request = PrivacyRequest::new(
            Policy::new("p"),
            [("email".to_string(), json!("a@b.c"))].into_iter().collect(),
        );
        request.derived_identity = [
            ("email".to_string(), json!("other@b.c")),
            ("customer_id".to_string(), json!(7)),
        ]
        .into_iter()
        .collect();

        let identity = request.effective_identity();
        assert_eq!(identity["email"], json!("a@b.c"));
        assert_eq!(identity["customer_id"], json!(7));
    }

    #[test]
    fn test_set_status_marks_finish() {
        let mut request = PrivacyRequest::new(Policy::new("p"), IdentitySeeds::new());
        request.set_status(RequestStatus::InProcessing);
        assert!(request.finished_at.is_none());
        request.set_status(RequestStatus::Complete);
        assert!(request.finished_at.is_some());
    }
}
