//! Collection and field addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Uniquely identifies one collection (table, document collection, SaaS
/// endpoint) within the active dataset set.
///
/// Serialized as the string `dataset:collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionAddress {
    /// The dataset name.
    pub dataset: String,
    /// The collection name within the dataset.
    pub collection: String,
}

impl CollectionAddress {
    /// Creates a new collection address.
    #[must_use]
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    /// Returns the address of a field within this collection.
    #[must_use]
    pub fn field(&self, path: impl Into<String>) -> FieldAddress {
        FieldAddress {
            collection: self.clone(),
            path: path.into(),
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.collection)
    }
}

impl FromStr for CollectionAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((dataset, collection)) if !dataset.is_empty() && !collection.is_empty() => {
                Ok(Self::new(dataset, collection))
            }
            _ => Err(format!("invalid collection address '{s}', expected 'dataset:collection'")),
        }
    }
}

impl TryFrom<String> for CollectionAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CollectionAddress> for String {
    fn from(addr: CollectionAddress) -> Self {
        addr.to_string()
    }
}

/// A field within a collection. Nested document fields use dotted paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldAddress {
    /// The owning collection.
    pub collection: CollectionAddress,
    /// Dotted field path, e.g. `address.city`.
    pub path: String,
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr = CollectionAddress::new("postgres_example", "customer");
        assert_eq!(addr.to_string(), "postgres_example:customer");

        let parsed: CollectionAddress = "postgres_example:customer".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_address_parse_rejects_malformed() {
        assert!("customer".parse::<CollectionAddress>().is_err());
        assert!(":customer".parse::<CollectionAddress>().is_err());
        assert!("db:".parse::<CollectionAddress>().is_err());
    }

    #[test]
    fn test_address_serializes_as_string() {
        let addr = CollectionAddress::new("db", "orders");
        assert_eq!(serde_json::to_string(&addr).unwrap(), r#""db:orders""#);

        let back: CollectionAddress = serde_json::from_str(r#""db:orders""#).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<CollectionAddress>(r#""orders""#).is_err());
    }

    #[test]
    fn test_field_address_display() {
        let field = CollectionAddress::new("mongo", "users").field("address.city");
        assert_eq!(field.to_string(), "mongo:users.address.city");
    }

    #[test]
    fn test_address_ordering_is_stable() {
        let mut addrs = vec![
            CollectionAddress::new("b", "x"),
            CollectionAddress::new("a", "z"),
            CollectionAddress::new("a", "y"),
        ];
        addrs.sort();
        assert_eq!(addrs[0].to_string(), "a:y");
        assert_eq!(addrs[2].to_string(), "b:x");
    }
}
