//! # Privacy Engine
//!
//! A graph-based execution engine for privacy requests.
//!
//! Given dataset annotations, a policy and a set of identity seeds, the
//! engine works out which collections hold the subject's data, reads them
//! in dependency order, masks the fields the policy targets and propagates
//! consent preferences. It provides:
//!
//! - **Graph traversal**: Identity-seeded, reference-linked collection graphs with cycle detection
//! - **Masking strategies**: Null rewrite, string rewrite, random string, hash, HMAC and AES
//! - **Connectors**: SQL, document, SaaS (including submit-then-poll reads) and manual entry
//! - **Durable tasks**: Per-collection tasks with leases, retries and resumable checkpoints
//! - **Webhooks**: Pre- and post-execution hooks that can halt a request or derive identities
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use privacy_engine::prelude::*;
//!
//! let connectors = ConnectorRegistry::new().with_connector("postgres", Arc::new(sql_connector));
//! let ctx = Arc::new(EngineContext::new(EngineConfig::default(), connectors));
//! let orchestrator = Orchestrator::new(ctx, datasets);
//!
//! let id = orchestrator.submit(PrivacyRequest::new(policy, identity)).await?;
//! let status = orchestrator.run(id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod connectors;
pub mod core;
pub mod errors;
pub mod events;
pub mod execution;
pub mod graph;
pub mod masking;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod tasks;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::connectors::{
        Connector, ConnectorRegistry, ConsentPreference, DocumentConnector, ManualConnector, SqlConnector,
    };
    #[cfg(feature = "http")]
    pub use crate::connectors::{SaasConfig, SaasConnector};
    pub use crate::core::{
        ActionType, CollectionAddress, FieldAddress, IdentitySeeds, MaskingStrategyConfig, PipelineCheckpoint,
        Policy, RequestStatus, Row, Rule, TaskStatus,
    };
    pub use crate::errors::{ConnectorError, EngineError, GraphValidationError, MaskingStrategyError, StoreError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::execution::{EngineContext, TaskRunner, Worker};
    pub use crate::graph::{CollectionConfig, DatasetConfig, FieldConfig, FieldReferenceConfig, Traversal};
    pub use crate::masking::MaskingStrategyRegistry;
    pub use crate::pipeline::{Orchestrator, Webhook, WebhookClient};
    pub use crate::retry::{PollConfig, RetryConfig};
    pub use crate::tasks::{PrivacyRequest, RequestTask, RequestStore, TaskStore};
}
