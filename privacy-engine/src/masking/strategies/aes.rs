//! `aes_encrypt`: deterministic AES-256-GCM.
//!
//! The nonce is the first 12 bytes of HMAC-SHA256 over the plaintext, so the
//! same value encrypts to the same token within a request. Output is
//! base64(nonce || ciphertext).

use super::hmac::hmac_sha256;
use crate::errors::MaskingStrategyError;
use crate::masking::secrets::SecretType;
use crate::masking::strategy::{map_non_null, parse_config, value_bytes, MaskingContext, MaskingStrategy};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const NONCE_LEN: usize = 12;

/// Block cipher mode. Only GCM is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AesMode {
    /// Galois/Counter mode.
    #[default]
    #[serde(rename = "GCM")]
    Gcm,
}

/// Configuration for [`AesEncryptStrategy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesEncryptConfig {
    /// Cipher mode.
    #[serde(default)]
    pub mode: AesMode,
}

/// Deterministic AES-256-GCM encryption with per-request keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesEncryptStrategy;

impl AesEncryptStrategy {
    /// Registered name.
    pub const NAME: &'static str = "aes_encrypt";

    /// Builds the strategy from its configuration.
    pub fn from_config(configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        let AesEncryptConfig { mode: AesMode::Gcm } = parse_config(Self::NAME, configuration)?;
        Ok(Box::new(Self))
    }

    fn cipher(context: &MaskingContext) -> Result<Aes256Gcm, MaskingStrategyError> {
        let key = context.secret(Self::NAME, SecretType::Key);
        <Aes256Gcm as KeyInit>::new_from_slice(key.expose())
            .map_err(|_| MaskingStrategyError::new(Self::NAME, "invalid key length"))
    }

    /// Recovers the plaintext of a token produced in the same request.
    pub fn decrypt(token: &str, context: &MaskingContext) -> Result<Vec<u8>, MaskingStrategyError> {
        let raw = STANDARD
            .decode(token)
            .map_err(|_| MaskingStrategyError::new(Self::NAME, "token is not base64"))?;
        if raw.len() <= NONCE_LEN {
            return Err(MaskingStrategyError::new(Self::NAME, "token too short"));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        Self::cipher(context)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| MaskingStrategyError::new(Self::NAME, "decryption failed"))
    }
}

impl MaskingStrategy for AesEncryptStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn secrets_required(&self) -> &'static [SecretType] {
        &[SecretType::Key, SecretType::HmacKey]
    }

    fn mask(&self, values: &[Value], context: &MaskingContext) -> Result<Vec<Value>, MaskingStrategyError> {
        let cipher = Self::cipher(context)?;
        let nonce_key = context.secret(Self::NAME, SecretType::HmacKey);
        map_non_null(values, |value| {
            let plaintext = value_bytes(value);
            let digest = hmac_sha256(nonce_key.expose(), &plaintext, &[])?;
            let nonce = &digest[..NONCE_LEN];
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(nonce), plaintext.as_slice())
                .map_err(|_| MaskingStrategyError::new(Self::NAME, "encryption failed"))?;

            let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            token.extend_from_slice(nonce);
            token.extend_from_slice(&ciphertext);
            Ok(Value::String(STANDARD.encode(token)))
        })
    }
}
