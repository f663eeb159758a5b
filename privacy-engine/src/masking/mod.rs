//! Masking strategy engine.
//!
//! Strategies are looked up by name in an explicit
//! [`MaskingStrategyRegistry`] and applied in chains during erasure.
//! Secret material comes from the request-scoped [`MaskingSecretCache`].

mod registry;
mod secrets;
pub mod strategies;
mod strategy;

pub use registry::{MaskingStrategyRegistry, StrategyFactory};
pub use secrets::{MaskingSecret, MaskingSecretCache, SecretType, SECRET_LEN};
pub use strategy::{FormatPreservation, MaskingContext, MaskingStrategy};
