//! Connector dispatch layer.
//!
//! Every backing store sits behind the [`Connector`] trait. A connector
//! advertises what it can do through [`ConnectorCapabilities`]; operations it
//! does not support return [`ConnectorError::Unsupported`]. Dialect details
//! (identifier quoting, placeholders, filter syntax, HTTP templates) stay
//! inside each implementation.

mod document;
mod manual;
#[cfg(feature = "http")]
pub mod saas;
mod sql;

pub use document::{DocumentClient, DocumentConnector};
pub use manual::ManualConnector;
#[cfg(feature = "http")]
pub use saas::{AsyncReadConfig, EndpointConfig, HttpMethod, SaasAuth, SaasConfig, SaasConnector, SaasRequest};
pub use sql::{SqlClient, SqlConnector, SqlDialect};

use crate::core::{IdentitySeeds, Row};
use crate::errors::ConnectorError;
use crate::graph::TraversalNode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Query values per field path. A row matches if any field matches any of
/// its values.
pub type QueryConditions = BTreeMap<String, Vec<Value>>;

/// What a connector can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorCapabilities {
    /// Synchronous retrieval.
    pub query: bool,
    /// Synchronous updates.
    pub mutate: bool,
    /// Submit-then-poll retrieval.
    pub async_submit_poll: bool,
    /// Consent propagation.
    pub consent: bool,
    /// Data is supplied by a person rather than fetched.
    pub manual: bool,
}

/// One masked row to write back, addressed by primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    /// Primary key field values.
    pub key: BTreeMap<String, Value>,
    /// New values by field path.
    pub changes: BTreeMap<String, Value>,
}

/// Handle for a submitted async job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncHandle {
    /// Remote job id.
    pub job_id: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Connector-specific state needed to poll.
    #[serde(default)]
    pub context: Value,
}

impl AsyncHandle {
    /// Creates a handle submitted now.
    #[must_use]
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at: Utc::now(),
            context: Value::Null,
        }
    }

    /// Attaches connector state.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Result of polling an async job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Not finished yet.
    Pending,
    /// Finished with rows.
    Rows(Vec<Row>),
    /// The remote job failed permanently.
    Failed(String),
}

/// A consent preference to propagate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentPreference {
    /// Privacy notice or data use key.
    pub notice: String,
    /// True to opt in, false to opt out.
    pub opt_in: bool,
}

/// A backing store adapter.
///
/// A call serves exactly one task and must not touch any other.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Short connector kind, e.g. `postgres`.
    fn kind(&self) -> &'static str;

    /// Supported operations.
    fn capabilities(&self) -> ConnectorCapabilities;

    /// Whether reads for this node go through submit-then-poll.
    fn uses_async_read(&self, _node: &TraversalNode) -> bool {
        self.capabilities().async_submit_poll
    }

    /// Retrieves rows matching the conditions.
    async fn retrieve(&self, node: &TraversalNode, conditions: &QueryConditions) -> Result<Vec<Row>, ConnectorError>;

    /// Writes masked values back. Returns the number of affected rows.
    async fn mutate(&self, _node: &TraversalNode, _updates: &[RowUpdate]) -> Result<usize, ConnectorError> {
        Err(ConnectorError::unsupported("mutate"))
    }

    /// Submits an async retrieval job.
    async fn submit_async(
        &self,
        _node: &TraversalNode,
        _conditions: &QueryConditions,
    ) -> Result<AsyncHandle, ConnectorError> {
        Err(ConnectorError::unsupported("submit_async"))
    }

    /// Checks an async job.
    async fn poll_async(&self, _node: &TraversalNode, _handle: &AsyncHandle) -> Result<PollOutcome, ConnectorError> {
        Err(ConnectorError::unsupported("poll_async"))
    }

    /// Propagates consent preferences for an identity. Returns true if the
    /// remote system accepted them.
    async fn update_consent(
        &self,
        _identity: &IdentitySeeds,
        _preferences: &[ConsentPreference],
    ) -> Result<bool, ConnectorError> {
        Err(ConnectorError::unsupported("update_consent"))
    }
}

/// Connection key to connector map.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under a connection key.
    #[must_use]
    pub fn with_connector(mut self, connection_key: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.register(connection_key, connector);
        self
    }

    /// Registers a connector under a connection key.
    pub fn register(&mut self, connection_key: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(connection_key.into(), connector);
    }

    /// Returns the connector for a connection key.
    pub fn get(&self, connection_key: &str) -> Result<Arc<dyn Connector>, ConnectorError> {
        self.connectors
            .get(connection_key)
            .cloned()
            .ok_or_else(|| ConnectorError::NotConfigured {
                connection_key: connection_key.to_string(),
            })
    }

    /// Registered connection keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connectors.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ConnectorRegistry::new().with_connector("manual", Arc::new(ManualConnector::new()));

        assert!(registry.get("manual").is_ok());
        assert_eq!(registry.keys(), vec!["manual".to_string()]);
        let err = registry.get("missing").unwrap_err();
        assert_eq!(
            err,
            ConnectorError::NotConfigured {
                connection_key: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_async_handle_serde() {
        let handle = AsyncHandle::new("job-1").with_context(serde_json::json!({"email": "a@b.c"}));
        let json = serde_json::to_string(&handle).unwrap();
        let back: AsyncHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }
}
