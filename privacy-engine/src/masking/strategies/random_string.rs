//! `random_string_rewrite`: replaces values with random alphanumerics.

use crate::errors::MaskingStrategyError;
use crate::masking::strategy::{map_non_null, parse_config, FormatPreservation, MaskingContext, MaskingStrategy};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for [`RandomStringRewriteStrategy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomStringRewriteConfig {
    /// Generated length.
    #[serde(default = "default_length")]
    pub length: usize,
    /// Optional suffix.
    #[serde(default)]
    pub format_preservation: Option<FormatPreservation>,
}

fn default_length() -> usize {
    30
}

impl Default for RandomStringRewriteConfig {
    fn default() -> Self {
        Self {
            length: default_length(),
            format_preservation: None,
        }
    }
}

/// Replaces each value with a fresh random string. Not deterministic.
#[derive(Debug, Clone)]
pub struct RandomStringRewriteStrategy {
    config: RandomStringRewriteConfig,
}

impl RandomStringRewriteStrategy {
    /// Registered name.
    pub const NAME: &'static str = "random_string_rewrite";

    /// Builds the strategy from its configuration.
    pub fn from_config(configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        let config: RandomStringRewriteConfig = parse_config(Self::NAME, configuration)?;
        if config.length == 0 {
            return Err(MaskingStrategyError::invalid_configuration(
                Self::NAME,
                "length must be positive",
            ));
        }
        Ok(Box::new(Self { config }))
    }
}

impl MaskingStrategy for RandomStringRewriteStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], _context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError> {
        let mut rng = rand::thread_rng();
        map_non_null(values, |_| {
            let masked: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(self.config.length)
                .map(char::from)
                .collect();
            Ok(Value::String(match &self.config.format_preservation {
                Some(fp) => fp.apply(masked),
                None => masked,
            }))
        })
    }
}
