//! Document store connector using Mongo-style filters.

use super::{Connector, ConnectorCapabilities, QueryConditions, RowUpdate};
use crate::core::Row;
use crate::errors::ConnectorError;
use crate::graph::TraversalNode;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

/// Raw access to a document database.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Finds documents in a collection matching a filter.
    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Row>, ConnectorError>;

    /// Applies an update to the first document matching a filter. Returns
    /// the number of modified documents.
    async fn update_one(&self, collection: &str, filter: &Value, update: &Value) -> Result<u64, ConnectorError>;
}

/// Document store connector.
///
/// Nested fields are addressed with dotted paths in both filters and `$set`
/// updates, so masked values land inside embedded documents.
#[derive(Clone)]
pub struct DocumentConnector {
    client: Arc<dyn DocumentClient>,
}

impl fmt::Debug for DocumentConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentConnector").finish_non_exhaustive()
    }
}

impl DocumentConnector {
    /// Creates a connector over a client.
    #[must_use]
    pub fn new(client: Arc<dyn DocumentClient>) -> Self {
        Self { client }
    }

    /// Builds `{"f": {"$in": [...]}}`, or an `$or` of those for several fields.
    #[must_use]
    pub fn build_filter(conditions: &QueryConditions) -> Option<Value> {
        let mut clauses: Vec<Value> = conditions
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(field, values)| {
                let mut clause = Map::new();
                clause.insert(field.clone(), json!({ "$in": values }));
                Value::Object(clause)
            })
            .collect();

        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(json!({ "$or": clauses })),
        }
    }

    /// Builds the key filter and `$set` document for one update.
    pub fn build_update(update: &RowUpdate) -> Result<(Value, Value), ConnectorError> {
        if update.key.is_empty() {
            return Err(ConnectorError::permanent("document update without a key"));
        }
        let filter: Map<String, Value> = update.key.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let set: Map<String, Value> = update.changes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok((Value::Object(filter), json!({ "$set": set })))
    }
}

#[async_trait]
impl Connector for DocumentConnector {
    fn kind(&self) -> &'static str {
        "document"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            query: true,
            mutate: true,
            ..ConnectorCapabilities::default()
        }
    }

    async fn retrieve(&self, node: &TraversalNode, conditions: &QueryConditions) -> Result<Vec<Row>, ConnectorError> {
        let Some(filter) = Self::build_filter(conditions) else {
            return Ok(Vec::new());
        };
        tracing::debug!(collection = %node.address, "Executing document find");
        self.client.find(&node.address.collection, &filter).await
    }

    async fn mutate(&self, node: &TraversalNode, updates: &[RowUpdate]) -> Result<usize, ConnectorError> {
        let mut modified = 0usize;
        for update in updates {
            let (filter, set) = Self::build_update(update)?;
            let count = self.client.update_one(&node.address.collection, &filter, &set).await?;
            modified += usize::try_from(count).unwrap_or(usize::MAX);
        }
        Ok(modified)
    }
}
