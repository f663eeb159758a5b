//! `hash`: salted SHA-2 digest, hex encoded.

use crate::errors::MaskingStrategyError;
use crate::masking::secrets::SecretType;
use crate::masking::strategy::{
    map_non_null, parse_config, value_bytes, FormatPreservation, MaskingContext, MaskingStrategy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

/// Digest algorithm for [`HashStrategy`] and the HMAC strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    /// SHA-256.
    #[default]
    #[serde(rename = "SHA-256")]
    Sha256,
    /// SHA-512.
    #[serde(rename = "SHA-512")]
    Sha512,
}

/// Configuration for [`HashStrategy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashConfig {
    /// Digest algorithm.
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
    /// Optional suffix.
    #[serde(default)]
    pub format_preservation: Option<FormatPreservation>,
}

/// Deterministic salted hash. The salt is a per-request secret.
#[derive(Debug, Clone)]
pub struct HashStrategy {
    config: HashConfig,
}

impl HashStrategy {
    /// Registered name.
    pub const NAME: &'static str = "hash";

    /// Builds the strategy from its configuration.
    pub fn from_config(configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        Ok(Box::new(Self {
            config: parse_config(Self::NAME, configuration)?,
        }))
    }

    fn digest(&self, value: &[u8], salt: &[u8]) -> String {
        match self.config.algorithm {
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(value);
                hasher.update(salt);
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                hasher.update(value);
                hasher.update(salt);
                hex::encode(hasher.finalize())
            }
        }
    }
}

impl MaskingStrategy for HashStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn secrets_required(&self) -> &'static [SecretType] {
        &[SecretType::Salt]
    }

    fn mask(&self, values: &[Value], context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError> {
        let salt = context.secret(Self::NAME, SecretType::Salt);
        map_non_null(values, |value| {
            let masked = self.digest(&value_bytes(value), salt.expose());
            Ok(Value::String(match &self.config.format_preservation {
                Some(fp) => fp.apply(masked),
                None => masked,
            }))
        })
    }
}
