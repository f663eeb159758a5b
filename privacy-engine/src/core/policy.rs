//! Policies, rules and data category matching.

use super::ActionType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named masking strategy plus its configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingStrategyConfig {
    /// Registered strategy name, e.g. `hash`.
    pub strategy: String,
    /// Strategy-specific configuration.
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl MaskingStrategyConfig {
    /// Creates a new strategy configuration.
    #[must_use]
    pub fn new(strategy: impl Into<String>, configuration: serde_json::Value) -> Self {
        Self {
            strategy: strategy.into(),
            configuration,
        }
    }
}

/// One policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule name.
    pub name: String,
    /// The action this rule triggers.
    pub action: ActionType,
    /// Targeted data categories. A target matches itself and every
    /// category beneath it.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Masking chain for erasure rules, applied in order.
    #[serde(default)]
    pub masking: Vec<MaskingStrategyConfig>,
}

impl Rule {
    /// Creates an access rule.
    #[must_use]
    pub fn access(name: impl Into<String>, targets: &[&str]) -> Self {
        Self {
            name: name.into(),
            action: ActionType::Access,
            targets: targets.iter().map(ToString::to_string).collect(),
            masking: Vec::new(),
        }
    }

    /// Creates an erasure rule.
    #[must_use]
    pub fn erasure(name: impl Into<String>, targets: &[&str], masking: Vec<MaskingStrategyConfig>) -> Self {
        Self {
            name: name.into(),
            action: ActionType::Erasure,
            targets: targets.iter().map(ToString::to_string).collect(),
            masking,
        }
    }

    /// Creates a consent rule.
    #[must_use]
    pub fn consent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: ActionType::Consent,
            targets: Vec::new(),
            masking: Vec::new(),
        }
    }

    /// Returns true if any target covers any of the given categories.
    #[must_use]
    pub fn targets_any(&self, categories: &[String]) -> bool {
        categories
            .iter()
            .any(|category| self.targets.iter().any(|target| category_matches(target, category)))
    }
}

/// Returns true if `target` is `category` or one of its ancestors.
#[must_use]
pub fn category_matches(target: &str, category: &str) -> bool {
    category == target
        || (category.len() > target.len()
            && category.starts_with(target)
            && category.as_bytes()[target.len()] == b'.')
}

/// A privacy policy: the rules a request executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy key.
    pub key: String,
    /// Ordered rules.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Creates an empty policy.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            rules: Vec::new(),
        }
    }

    /// Adds a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The actions this policy asks for.
    #[must_use]
    pub fn actions(&self) -> BTreeSet<ActionType> {
        self.rules.iter().map(|r| r.action).collect()
    }

    /// Returns true if the policy contains at least one rule for `action`.
    #[must_use]
    pub fn has_action(&self, action: ActionType) -> bool {
        self.rules.iter().any(|r| r.action == action)
    }

    /// Rules for one action, in declaration order.
    pub fn rules_for(&self, action: ActionType) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.action == action)
    }

    /// Returns true if an access rule covers a field with these categories.
    #[must_use]
    pub fn access_targets(&self, categories: &[String]) -> bool {
        self.rules_for(ActionType::Access).any(|r| r.targets_any(categories))
    }

    /// The masking chain for a field with these categories.
    ///
    /// Chains of every matching erasure rule are concatenated in rule order.
    #[must_use]
    pub fn masking_chain(&self, categories: &[String]) -> Vec<MaskingStrategyConfig> {
        self.rules_for(ActionType::Erasure)
            .filter(|r| r.targets_any(categories))
            .flat_map(|r| r.masking.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_category_prefix_match() {
        assert!(category_matches("user.contact", "user.contact"));
        assert!(category_matches("user.contact", "user.contact.email"));
        assert!(category_matches("user", "user.contact.email"));
        assert!(!category_matches("user.contact", "user.contactless"));
        assert!(!category_matches("user.contact.email", "user.contact"));
    }

    #[test]
    fn test_policy_actions() {
        let policy = Policy::new("default")
            .with_rule(Rule::access("read", &["user"]))
            .with_rule(Rule::consent("opt_out"));

        assert!(policy.has_action(ActionType::Access));
        assert!(!policy.has_action(ActionType::Erasure));
        assert_eq!(
            policy.actions().into_iter().collect::<Vec<_>>(),
            vec![ActionType::Access, ActionType::Consent]
        );
    }

    #[test]
    fn test_masking_chain_in_rule_order() {
        let policy = Policy::new("erase")
            .with_rule(Rule::erasure(
                "first",
                &["user.contact"],
                vec![MaskingStrategyConfig::new("hash", json!({}))],
            ))
            .with_rule(Rule::erasure(
                "second",
                &["user"],
                vec![MaskingStrategyConfig::new("string_rewrite", json!({"rewrite_value": "x"}))],
            ))
            .with_rule(Rule::erasure(
                "unrelated",
                &["system"],
                vec![MaskingStrategyConfig::new("null_rewrite", json!({}))],
            ));

        let chain = policy.masking_chain(&["user.contact.email".to_string()]);
        let names: Vec<_> = chain.iter().map(|c| c.strategy.as_str()).collect();
        assert_eq!(names, vec!["hash", "string_rewrite"]);

        assert!(policy.masking_chain(&["other".to_string()]).is_empty());
    }

    #[test]
    fn test_policy_deserialize() {
        let policy: Policy = serde_json::from_value(json!({
            "key": "p",
            "rules": [{
                "name": "mask",
                "action": "erasure",
                "targets": ["user.contact.email"],
                "masking": [{"strategy": "null_rewrite"}]
            }]
        }))
        .unwrap();

        assert_eq!(policy.rules[0].masking[0].configuration, serde_json::Value::Null);
        assert!(policy.has_action(ActionType::Erasure));
    }
}
