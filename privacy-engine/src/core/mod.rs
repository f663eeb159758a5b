//! Core domain types for the privacy request engine.
//!
//! This module contains the vocabulary shared by every component:
//! - Collection and field addresses
//! - Action, task and request status enums
//! - Pipeline checkpoints
//! - Rows and policies

mod address;
mod checkpoint;
mod policy;
pub mod row;
mod status;

pub use address::{CollectionAddress, FieldAddress};
pub use checkpoint::PipelineCheckpoint;
pub use policy::{category_matches, MaskingStrategyConfig, Policy, Rule};
pub use row::Row;
pub use status::{ActionType, RequestStatus, TaskStatus};

/// Identity values supplied with a request, keyed by identity type
/// (`email`, `phone_number`, `customer_id`, ...).
pub type IdentitySeeds = std::collections::BTreeMap<String, serde_json::Value>;
