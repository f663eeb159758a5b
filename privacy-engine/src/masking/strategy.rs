//! The masking strategy contract.

use super::secrets::{MaskingSecret, MaskingSecretCache, SecretType};
use crate::errors::MaskingStrategyError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Per-request state a strategy may need while masking.
#[derive(Debug, Clone)]
pub struct MaskingContext {
    /// The privacy request being erased.
    pub privacy_request_id: Uuid,
    secrets: Arc<MaskingSecretCache>,
}

impl MaskingContext {
    /// Creates a context backed by a secret cache.
    #[must_use]
    pub fn new(privacy_request_id: Uuid, secrets: Arc<MaskingSecretCache>) -> Self {
        Self {
            privacy_request_id,
            secrets,
        }
    }

    /// Returns the secret for `strategy`, generating it on first use.
    #[must_use]
    pub fn secret(&self, strategy: &str, secret_type: SecretType) -> Arc<MaskingSecret> {
        self.secrets
            .get_or_generate(self.privacy_request_id, strategy, secret_type)
    }
}

/// A named, configured value transformation.
///
/// Strategies see every value of one field at once so order-sensitive
/// strategies are possible. Null inputs stay null.
pub trait MaskingStrategy: Send + Sync + std::fmt::Debug {
    /// Registered strategy name.
    fn name(&self) -> &'static str;

    /// Secrets fetched from the cache while masking.
    fn secrets_required(&self) -> &'static [SecretType] {
        &[]
    }

    /// Masks a batch of values, preserving length and order.
    fn mask(&self, values: &[Value], context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError>;
}

/// Optional suffix appended to masked strings, e.g. `@masked.example`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPreservation {
    /// Appended suffix.
    #[serde(default)]
    pub suffix: Option<String>,
}

impl FormatPreservation {
    /// Applies the suffix, if any.
    #[must_use]
    pub fn apply(&self, masked: String) -> String {
        match &self.suffix {
            Some(suffix) => masked + suffix,
            None => masked,
        }
    }
}

/// Parses a strategy configuration; `null` means all defaults.
pub(crate) fn parse_config<T>(strategy: &str, configuration: &Value) -> Result<T, MaskingStrategyError>
where
    T: DeserializeOwned + Default,
{
    if configuration.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(configuration.clone())
        .map_err(|e| MaskingStrategyError::invalid_configuration(strategy, e))
}

/// Maps every non-null value through `f`.
pub(crate) fn map_non_null<F>(values: &[Value], mut f: F) -> Result<Vec<Value>, MaskingStrategyError>
where
    F: FnMut(&Value) -> Result<Value, MaskingStrategyError>,
{
    values
        .iter()
        .map(|v| if v.is_null() { Ok(Value::Null) } else { f(v) })
        .collect()
}

/// The bytes a strategy hashes or encrypts: strings as-is, other values as JSON.
pub(crate) fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}
