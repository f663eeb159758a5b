//! Name to factory registry for masking strategies.

use super::strategies::{
    AesEncryptStrategy, HashStrategy, HmacStrategy, NullRewriteStrategy, RandomStringRewriteStrategy,
    StringRewriteStrategy,
};
use super::strategy::{MaskingContext, MaskingStrategy};
use crate::core::MaskingStrategyConfig;
use crate::errors::MaskingStrategyError;
use serde_json::Value;
use std::collections::HashMap;

/// Factory function type for creating strategies from configuration.
pub type StrategyFactory = fn(&Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError>;

/// Explicit registry of masking strategies, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct MaskingStrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl MaskingStrategyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in strategy.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(NullRewriteStrategy::NAME, NullRewriteStrategy::from_config);
        registry.register(StringRewriteStrategy::NAME, StringRewriteStrategy::from_config);
        registry.register(RandomStringRewriteStrategy::NAME, RandomStringRewriteStrategy::from_config);
        registry.register(HashStrategy::NAME, HashStrategy::from_config);
        registry.register(HmacStrategy::NAME, HmacStrategy::from_config);
        registry.register(AesEncryptStrategy::NAME, AesEncryptStrategy::from_config);
        registry
    }

    /// Registers a factory, replacing any previous one under the same name.
    pub fn register(&mut self, name: impl Into<String>, factory: StrategyFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Returns true if a strategy is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds one strategy from its configuration.
    pub fn build(&self, config: &MaskingStrategyConfig) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
        let factory = self
            .factories
            .get(&config.strategy)
            .ok_or_else(|| MaskingStrategyError::unknown(&config.strategy))?;
        factory(&config.configuration)
    }

    /// Validates a chain without running it.
    pub fn validate_chain(&self, chain: &[MaskingStrategyConfig]) -> Result<(), MaskingStrategyError> {
        for config in chain {
            self.build(config)?;
        }
        Ok(())
    }

    /// Applies a chain of strategies in order, feeding each output into the
    /// next strategy.
    pub fn mask_chain(
        &self,
        chain: &[MaskingStrategyConfig],
        values: Vec<Value>,
        context: &MaskingContext,
    ) -> Result<Vec<Value>, MaskingStrategyError> {
        let mut current = values;
        for config in chain {
            let strategy = self.build(config)?;
            let expected = current.len();
            current = strategy.mask(&current, context)?;
            if current.len() != expected {
                return Err(MaskingStrategyError::new(
                    strategy.name(),
                    format!("returned {} values for {expected} inputs", current.len()),
                ));
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::MaskingSecretCache;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context() -> MaskingContext {
        MaskingContext::new(Uuid::new_v4(), Arc::new(MaskingSecretCache::new()))
    }

    #[test]
    fn test_defaults_registered() {
        let registry = MaskingStrategyRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec![
                "aes_encrypt",
                "hash",
                "hmac",
                "null_rewrite",
                "random_string_rewrite",
                "string_rewrite"
            ]
        );
    }

    #[test]
    fn test_unknown_strategy() {
        let registry = MaskingStrategyRegistry::with_defaults();
        let err = registry
            .build(&MaskingStrategyConfig::new("rot13", json!({})))
            .unwrap_err();
        assert_eq!(err, MaskingStrategyError::unknown("rot13"));
    }

    #[test]
    fn test_chain_threads_output() {
        let registry = MaskingStrategyRegistry::with_defaults();
        let chain = vec![
            MaskingStrategyConfig::new("string_rewrite", json!({"rewrite_value": "abc"})),
            MaskingStrategyConfig::new("hash", json!({})),
        ];
        let ctx = context();

        let chained = registry.mask_chain(&chain, vec![json!("x"), json!("y")], &ctx).unwrap();
        let direct = registry
            .mask_chain(&chain[1..], vec![json!("abc")], &ctx)
            .unwrap();

        assert_eq!(chained[0], direct[0]);
        assert_eq!(chained[0], chained[1]);
    }

    #[test]
    fn test_chain_order_matters() {
        let registry = MaskingStrategyRegistry::with_defaults();
        let rewrite = MaskingStrategyConfig::new("string_rewrite", json!({"rewrite_value": "abc"}));
        let null = MaskingStrategyConfig::new("null_rewrite", Value::Null);
        let ctx = context();

        let a = registry
            .mask_chain(&[rewrite.clone(), null.clone()], vec![json!("x")], &ctx)
            .unwrap();
        let b = registry.mask_chain(&[null, rewrite], vec![json!("x")], &ctx).unwrap();

        assert_eq!(a, vec![Value::Null]);
        // null inputs pass through later strategies untouched
        assert_eq!(b, vec![Value::Null]);
    }

    #[test]
    fn test_validate_chain() {
        let registry = MaskingStrategyRegistry::with_defaults();
        assert!(registry
            .validate_chain(&[MaskingStrategyConfig::new("hash", json!({"algorithm": "SHA-512"}))])
            .is_ok());
        assert!(registry
            .validate_chain(&[MaskingStrategyConfig::new("hash", json!({"algorithm": "SHA-1"}))])
            .is_err());
    }

    #[test]
    fn test_custom_registration() {
        fn factory(_: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingStrategyError> {
            Ok(Box::new(NullRewriteStrategy))
        }

        let mut registry = MaskingStrategyRegistry::new();
        assert!(!registry.contains("wipe"));
        registry.register("wipe", factory);
        assert!(registry.contains("wipe"));
    }
}
