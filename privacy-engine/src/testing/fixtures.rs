//! Sample datasets, policies and rows.

use crate::core::{IdentitySeeds, MaskingStrategyConfig, Policy, Row, Rule};
use crate::graph::{CollectionConfig, DatasetConfig, FieldConfig, FieldReferenceConfig};
use serde_json::{json, Value};

/// Dataset name used by the sample fixtures.
pub const SAMPLE_DATASET: &str = "postgres_example";

/// Connection key used by the sample fixtures.
pub const SAMPLE_CONNECTION: &str = "postgres";

/// `customer` seeded by email, and `orders` queried by `customer.id`.
#[must_use]
pub fn customer_orders_dataset() -> DatasetConfig {
    DatasetConfig::new(SAMPLE_DATASET, SAMPLE_CONNECTION)
        .with_collection(
            CollectionConfig::new("customer")
                .with_field(FieldConfig::new("id").primary_key().with_categories(&["system.operations"]))
                .with_field(
                    FieldConfig::new("email")
                        .with_identity("email")
                        .with_categories(&["user.contact.email"]),
                )
                .with_field(FieldConfig::new("name").with_categories(&["user.name"])),
        )
        .with_collection(
            CollectionConfig::new("orders")
                .with_field(FieldConfig::new("id").primary_key().with_categories(&["system.operations"]))
                .with_field(
                    FieldConfig::new("customer_id")
                        .with_categories(&["user.unique_id"])
                        .with_reference(FieldReferenceConfig::from(SAMPLE_DATASET, "customer.id")),
                )
                .with_field(FieldConfig::new("shipping_address").with_categories(&["user.contact.address"])),
        )
}

/// Identity seeds holding one email address.
#[must_use]
pub fn email_identity(email: &str) -> IdentitySeeds {
    [("email".to_string(), json!(email))].into_iter().collect()
}

/// Converts a JSON object into a row. Non-objects give an empty row.
#[must_use]
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Customer rows: one for `customer-1@example.com` and one unrelated.
#[must_use]
pub fn customer_rows() -> Vec<Row> {
    vec![
        row(json!({"id": 1, "email": "customer-1@example.com", "name": "Ada"})),
        row(json!({"id": 2, "email": "customer-2@example.com", "name": "Grace"})),
    ]
}

/// Order rows for both sample customers.
#[must_use]
pub fn order_rows() -> Vec<Row> {
    vec![
        row(json!({"id": 10, "customer_id": 1, "shipping_address": "1 Main St"})),
        row(json!({"id": 11, "customer_id": 1, "shipping_address": "2 Side St"})),
        row(json!({"id": 12, "customer_id": 2, "shipping_address": "3 Far Rd"})),
    ]
}

/// Access to all `user` data.
#[must_use]
pub fn access_policy() -> Policy {
    Policy::new("access").with_rule(Rule::access("access_user_data", &["user"]))
}

/// Erasure of `target` with one masking strategy.
#[must_use]
pub fn erasure_policy(target: &str, strategy: MaskingStrategyConfig) -> Policy {
    Policy::new("erasure").with_rule(Rule::erasure("erase", &[target], vec![strategy]))
}

/// `null_rewrite` of contact emails.
#[must_use]
pub fn null_email_erasure_policy() -> Policy {
    erasure_policy("user.contact.email", MaskingStrategyConfig::new("null_rewrite", json!({})))
}
