//! `hmac`: keyed HMAC-SHA2 with salt, hex encoded.

use super::hash::DigestAlgorithm;
use crate::errors::MaskingStrategyError;
use crate::masking::secrets::SecretType;
use crate::masking::strategy::{
    map_non_null, parse_config, value_bytes, FormatPreservation, MaskingContext, MaskingStrategy,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Configuration for [`HmacStrategy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmacConfig {
    /// Digest algorithm.
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
    /// Optional suffix.
    #[serde(default)]
    pub format_preservation: Option<FormatPreservation>,
}

/// Deterministic keyed digest using a per-request key and salt.
#[derive(Debug, Clone)]
pub struct HmacStrategy {
    config: HmacConfig,
}

impl HmacStrategy {
    /// Registered name.
    pub const NAME: &'static str = "hmac";

    /// Builds the strategy from its configuration.
    pub fn from_config(configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        Ok(Box::new(Self {
            config: parse_config(Self::NAME, configuration)?,
        }))
    }
}

/// HMAC-SHA256 of `value || salt`.
pub(crate) fn hmac_sha256(key: &[u8], value: &[u8], salt: &[u8]) -> Result<Vec<u8>, MaskingStrategyError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| MaskingStrategyError::new(HmacStrategy::NAME, "invalid key length"))?;
    mac.update(value);
    mac.update(salt);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_sha512(key: &[u8], value: &[u8], salt: &[u8]) -> Result<Vec<u8>, MaskingStrategyError> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(key)
        .map_err(|_| MaskingStrategyError::new(HmacStrategy::NAME, "invalid key length"))?;
    mac.update(value);
    mac.update(salt);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl MaskingStrategy for HmacStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn secrets_required(&self) -> &'static [SecretType] {
        &[SecretType::HmacKey, SecretType::Salt]
    }

    fn mask(&self, values: &[Value], context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError> {
        let key = context.secret(Self::NAME, SecretType::HmacKey);
        let salt = context.secret(Self::NAME, SecretType::Salt);
        map_non_null(values, |value| {
            let bytes = value_bytes(value);
            let digest = match self.config.algorithm {
                DigestAlgorithm::Sha256 => hmac_sha256(key.expose(), &bytes, salt.expose())?,
                DigestAlgorithm::Sha512 => hmac_sha512(key.expose(), &bytes, salt.expose())?,
            };
            let masked = hex::encode(digest);
            Ok(Value::String(match &self.config.format_preservation {
                Some(fp) => fp.apply(masked),
                None => masked,
            }))
        })
    }
}
