//! `null_rewrite`: replaces every value with null.

use crate::errors::MaskingStrategyError;
use crate::masking::strategy::{MaskingContext, MaskingStrategy};
use serde_json::Value;

/// Replaces every value with null.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRewriteStrategy;

impl NullRewriteStrategy {
    /// Registered name.
    pub const NAME: &'static str = "null_rewrite";

    /// Builds the strategy; the configuration is ignored.
    pub fn from_config(_configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        Ok(Box::new(Self))
    }
}

impl MaskingStrategy for NullRewriteStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], _context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError> {
        Ok(vec![Value::Null; values.len()])
    }
}
