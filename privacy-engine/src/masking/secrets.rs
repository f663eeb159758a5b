//! Request-scoped masking secrets.

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Length of generated secrets in bytes.
pub const SECRET_LEN: usize = 32;

/// The kind of secret material a strategy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// Encryption key.
    Key,
    /// Salt mixed into hashes.
    Salt,
    /// Key for HMAC computations.
    HmacKey,
}

/// Secret bytes. Zeroized on drop; never printed.
pub struct MaskingSecret {
    secret_type: SecretType,
    bytes: Zeroizing<Vec<u8>>,
}

impl MaskingSecret {
    /// Wraps existing secret material.
    #[must_use]
    pub fn new(secret_type: SecretType, bytes: Vec<u8>) -> Self {
        Self {
            secret_type,
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Generates fresh random material.
    #[must_use]
    pub fn generate(secret_type: SecretType) -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(secret_type, bytes)
    }

    /// The secret type.
    #[must_use]
    pub fn secret_type(&self) -> SecretType {
        self.secret_type
    }

    /// The raw secret bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MaskingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskingSecret")
            .field("secret_type", &self.secret_type)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

type SecretKey = (Uuid, String, SecretType);

/// Cache of masking secrets keyed by request, strategy and secret type.
///
/// Entries for one request never serve another request. Secrets live until
/// [`MaskingSecretCache::discard`] runs at the end of erasure.
#[derive(Debug, Default)]
pub struct MaskingSecretCache {
    secrets: DashMap<SecretKey, Arc<MaskingSecret>>,
}

impl MaskingSecretCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached secret, generating it on first use.
    #[must_use]
    pub fn get_or_generate(&self, request_id: Uuid, strategy: &str, secret_type: SecretType) -> Arc<MaskingSecret> {
        self.secrets
            .entry((request_id, strategy.to_string(), secret_type))
            .or_insert_with(|| {
                tracing::debug!(
                    privacy_request_id = %request_id,
                    strategy,
                    ?secret_type,
                    "Generated masking secret"
                );
                Arc::new(MaskingSecret::generate(secret_type))
            })
            .value()
            .clone()
    }

    /// Installs externally managed secret material.
    pub fn insert(&self, request_id: Uuid, strategy: &str, secret: MaskingSecret) {
        self.secrets
            .insert((request_id, strategy.to_string(), secret.secret_type()), Arc::new(secret));
    }

    /// Drops every secret of a request. Returns how many were removed.
    pub fn discard(&self, request_id: Uuid) -> usize {
        let before = self.secrets.len();
        self.secrets.retain(|(id, _, _), _| *id != request_id);
        let removed = before.saturating_sub(self.secrets.len());
        tracing::debug!(privacy_request_id = %request_id, removed, "Discarded masking secrets");
        removed
    }

    /// Returns true if any secret of the request is cached.
    #[must_use]
    pub fn contains_request(&self, request_id: Uuid) -> bool {
        self.secrets.iter().any(|entry| entry.key().0 == request_id)
    }

    /// Number of cached secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}
