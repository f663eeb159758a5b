//! Task model and persistence.
//!
//! A [`RequestTask`] is one action on one collection. Tasks and requests
//! are plain serde structs behind the [`TaskStore`] and [`RequestStore`]
//! traits; large row payloads go to an [`ArtifactStore`].

mod artifacts;
mod model;
mod request;
mod store;

pub use artifacts::{ArtifactRef, ArtifactStore, InMemoryArtifactStore};
pub use model::{RequestTask, TaskData, TaskErrorDetail, WorkerLease, CONSENT_COLLECTION, UPSTREAM_FAILED};
pub use request::{PrivacyRequest, WebhookResumePoint};
pub use store::{InMemoryRequestStore, InMemoryTaskStore, RequestStore, TaskStore};
