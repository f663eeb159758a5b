//! Connector for data supplied by a person.

use super::{Connector, ConnectorCapabilities, QueryConditions};
use crate::core::Row;
use crate::errors::ConnectorError;
use crate::graph::TraversalNode;
use async_trait::async_trait;

/// Marks collections whose rows are entered manually.
///
/// The task runner never fetches from it: a task on a manual collection
/// waits in `requires_input` until rows are supplied for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualConnector;

impl ManualConnector {
    /// Creates the connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ManualConnector {
    fn kind(&self) -> &'static str {
        "manual"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            manual: true,
            ..ConnectorCapabilities::default()
        }
    }

    async fn retrieve(&self, node: &TraversalNode, _conditions: &QueryConditions) -> Result<Vec<Row>, ConnectorError> {
        Err(ConnectorError::permanent(format!(
            "collection '{}' is manual; rows must be supplied",
            node.address
        )))
    }
}
