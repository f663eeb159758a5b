//! `string_rewrite`: replaces values with a fixed string.

use crate::errors::MaskingStrategyError;
use crate::masking::strategy::{map_non_null, parse_config, FormatPreservation, MaskingContext, MaskingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for [`StringRewriteStrategy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringRewriteConfig {
    /// Replacement value.
    #[serde(default = "default_rewrite_value")]
    pub rewrite_value: String,
    /// Optional suffix.
    #[serde(default)]
    pub format_preservation: Option<FormatPreservation>,
}

fn default_rewrite_value() -> String {
    "MASKED".to_string()
}

impl Default for StringRewriteConfig {
    fn default() -> Self {
        Self {
            rewrite_value: default_rewrite_value(),
            format_preservation: None,
        }
    }
}

/// Replaces every non-null value with a configured string.
#[derive(Debug, Clone)]
pub struct StringRewriteStrategy {
    config: StringRewriteConfig,
}

impl StringRewriteStrategy {
    /// Registered name.
    pub const NAME: &'static str = "string_rewrite";

    /// Builds the strategy from its configuration.
    pub fn from_config(configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        Ok(Box::new(Self {
            config: parse_config(Self::NAME, configuration)?,
        }))
    }
}

impl MaskingStrategy for StringRewriteStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], _context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError> {
        map_non_null(values, |_| {
            let masked = self.config.rewrite_value.clone();
            Ok(Value::String(match &self.config.format_preservation {
                Some(fp) => fp.apply(masked),
                None => masked,
            }))
        })
    }
}
