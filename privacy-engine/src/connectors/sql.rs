//! Relational connector with per-dialect statement generation.

use super::{Connector, ConnectorCapabilities, QueryConditions, RowUpdate};
use crate::core::Row;
use crate::errors::ConnectorError;
use crate::graph::TraversalNode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// SQL dialects the statement builder knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    /// PostgreSQL.
    Postgres,
    /// MySQL.
    MySql,
    /// MariaDB.
    MariaDb,
    /// Microsoft SQL Server.
    SqlServer,
    /// SQLite.
    Sqlite,
    /// Google BigQuery.
    BigQuery,
}

impl SqlDialect {
    /// Quotes an identifier, escaping embedded quote characters.
    #[must_use]
    pub fn quote(self, identifier: &str) -> String {
        match self {
            Self::Postgres | Self::Sqlite => format!("\"{}\"", identifier.replace('"', "\"\"")),
            Self::MySql | Self::MariaDb | Self::BigQuery => format!("`{}`", identifier.replace('`', "``")),
            Self::SqlServer => format!("[{}]", identifier.replace(']', "]]")),
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    #[must_use]
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::MariaDb | Self::Sqlite => "?".to_string(),
            Self::SqlServer | Self::BigQuery => format!("@p{index}"),
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MariaDb => "mariadb",
            Self::SqlServer => "sqlserver",
            Self::Sqlite => "sqlite",
            Self::BigQuery => "bigquery",
        }
    }
}

/// A generated statement and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    /// Statement text.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<Value>,
}

/// Executes statements against a database.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Runs a query and returns its rows.
    async fn query(&self, statement: &SqlStatement) -> Result<Vec<Row>, ConnectorError>;

    /// Runs a statement and returns the number of affected rows.
    async fn execute(&self, statement: &SqlStatement) -> Result<u64, ConnectorError>;
}

/// Relational database connector.
#[derive(Clone)]
pub struct SqlConnector {
    dialect: SqlDialect,
    client: Arc<dyn SqlClient>,
}

impl fmt::Debug for SqlConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConnector")
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl SqlConnector {
    /// Creates a connector for a dialect.
    #[must_use]
    pub fn new(dialect: SqlDialect, client: Arc<dyn SqlClient>) -> Self {
        Self { dialect, client }
    }

    /// Builds `SELECT <fields> FROM <table> WHERE a IN (...) OR b IN (...)`.
    #[must_use]
    pub fn build_select(&self, node: &TraversalNode, conditions: &QueryConditions) -> Option<SqlStatement> {
        let mut params = Vec::new();
        let mut clauses = Vec::new();
        for (field, values) in conditions.iter().filter(|(_, v)| !v.is_empty()) {
            let placeholders: Vec<String> = values
                .iter()
                .map(|value| {
                    params.push(value.clone());
                    self.dialect.placeholder(params.len())
                })
                .collect();
            clauses.push(format!(
                "{} IN ({})",
                self.dialect.quote(field),
                placeholders.join(", ")
            ));
        }
        if clauses.is_empty() {
            return None;
        }

        let columns: Vec<String> = node
            .collection
            .fields
            .iter()
            .map(|f| self.dialect.quote(&f.name))
            .collect();
        let columns = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };

        Some(SqlStatement {
            sql: format!(
                "SELECT {columns} FROM {} WHERE {}",
                self.dialect.quote(&node.address.collection),
                clauses.join(" OR ")
            ),
            params,
        })
    }

    /// Builds `UPDATE <table> SET ... WHERE <pk> = ...`.
    pub fn build_update(&self, node: &TraversalNode, update: &RowUpdate) -> Result<SqlStatement, ConnectorError> {
        if update.key.is_empty() {
            return Err(ConnectorError::permanent(format!(
                "collection '{}' has no primary key; refusing unkeyed update",
                node.address
            )));
        }
        if update.changes.is_empty() {
            return Err(ConnectorError::permanent("update has no changes"));
        }

        let mut params = Vec::new();
        let mut assign = |field: &String, value: &Value| {
            params.push(value.clone());
            format!("{} = {}", self.dialect.quote(field), self.dialect.placeholder(params.len()))
        };
        let sets: Vec<String> = update.changes.iter().map(|(f, v)| assign(f, v)).collect();
        let wheres: Vec<String> = update.key.iter().map(|(f, v)| assign(f, v)).collect();

        Ok(SqlStatement {
            sql: format!(
                "UPDATE {} SET {} WHERE {}",
                self.dialect.quote(&node.address.collection),
                sets.join(", "),
                wheres.join(" AND ")
            ),
            params,
        })
    }
}

#[async_trait]
impl Connector for SqlConnector {
    fn kind(&self) -> &'static str {
        self.dialect.kind()
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            query: true,
            mutate: true,
            ..ConnectorCapabilities::default()
        }
    }

    async fn retrieve(&self, node: &TraversalNode, conditions: &QueryConditions) -> Result<Vec<Row>, ConnectorError> {
        let Some(statement) = self.build_select(node, conditions) else {
            return Ok(Vec::new());
        };
        tracing::debug!(
            collection = %node.address,
            dialect = self.kind(),
            params = statement.params.len(),
            "Executing select"
        );
        self.client.query(&statement).await
    }

    async fn mutate(&self, node: &TraversalNode, updates: &[RowUpdate]) -> Result<usize, ConnectorError> {
        let mut affected = 0usize;
        for update in updates {
            let statement = self.build_update(node, update)?;
            let rows = self.client.execute(&statement).await?;
            affected += usize::try_from(rows).unwrap_or(usize::MAX);
        }
        Ok(affected)
    }
}
