//! Dataset definitions.
//!
//! A dataset describes the collections behind one connection and the
//! references between their fields. Definitions are plain serde structs
//! and are usually loaded from JSON.

use crate::core::CollectionAddress;
use serde::{Deserialize, Serialize};

/// Which way values flow along a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDirection {
    /// The referenced field provides values used to query this field.
    #[default]
    From,
    /// This field's values are used to query the referenced field.
    To,
}

/// A declared reference from one field to a field in another collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldReferenceConfig {
    /// Target dataset name.
    pub dataset: String,
    /// Target field as `collection.path`, e.g. `customer.id`.
    pub field: String,
    /// Value flow direction. Defaults to `from`.
    #[serde(default)]
    pub direction: EdgeDirection,
}

impl FieldReferenceConfig {
    /// Creates a reference whose target provides values to the owning field.
    #[must_use]
    pub fn from(dataset: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            field: field.into(),
            direction: EdgeDirection::From,
        }
    }

    /// Creates a reference whose owning field provides values to the target.
    #[must_use]
    pub fn to(dataset: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            field: field.into(),
            direction: EdgeDirection::To,
        }
    }

    /// Splits the target into collection name and field path.
    #[must_use]
    pub fn target(&self) -> Option<(&str, &str)> {
        self.field
            .split_once('.')
            .filter(|(collection, path)| !collection.is_empty() && !path.is_empty())
    }
}

/// One field of a collection. Object fields nest further fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Field name (one path segment).
    pub name: String,
    /// Data categories for policy matching.
    #[serde(default)]
    pub data_categories: Vec<String>,
    /// Identity type this field can be queried by, e.g. `email`.
    #[serde(default)]
    pub identity: Option<String>,
    /// References to fields in other collections.
    #[serde(default)]
    pub references: Vec<FieldReferenceConfig>,
    /// Marks the field as (part of) the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Declared data type, informational.
    #[serde(default)]
    pub data_type: Option<String>,
    /// Nested fields of an object field.
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

impl FieldConfig {
    /// Creates a plain field.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Marks the field as an identity of the given type.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Marks the field as primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Adds data categories.
    #[must_use]
    pub fn with_categories(mut self, categories: &[&str]) -> Self {
        self.data_categories
            .extend(categories.iter().map(ToString::to_string));
        self
    }

    /// Adds a reference.
    #[must_use]
    pub fn with_reference(mut self, reference: FieldReferenceConfig) -> Self {
        self.references.push(reference);
        self
    }

    /// Adds a nested field.
    #[must_use]
    pub fn with_field(mut self, field: FieldConfig) -> Self {
        self.fields.push(field);
        self
    }
}

/// One collection (table, document collection, endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name.
    pub name: String,
    /// Top-level fields.
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    /// Collections that must finish before this one runs.
    #[serde(default)]
    pub after: Vec<CollectionAddress>,
    /// Collections that must finish erasure before this one is erased.
    #[serde(default)]
    pub erase_after: Vec<CollectionAddress>,
    /// Excludes the collection from traversal.
    #[serde(default)]
    pub skip_processing: bool,
}

impl CollectionConfig {
    /// Creates an empty collection.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, field: FieldConfig) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds an ordering dependency.
    #[must_use]
    pub fn with_after(mut self, address: CollectionAddress) -> Self {
        self.after.push(address);
        self
    }

    /// Adds an erasure ordering dependency.
    #[must_use]
    pub fn with_erase_after(mut self, address: CollectionAddress) -> Self {
        self.erase_after.push(address);
        self
    }

    /// Excludes the collection from traversal.
    #[must_use]
    pub fn skipped(mut self) -> Self {
        self.skip_processing = true;
        self
    }

    /// Returns every field, nested ones included, with dotted paths.
    #[must_use]
    pub fn flattened_fields(&self) -> Vec<(String, &FieldConfig)> {
        let mut out = Vec::new();
        flatten_into(&self.fields, None, &mut out);
        out
    }

    /// Looks up a field by dotted path.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&FieldConfig> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.iter().find(|f| f.name == first)?;
        for part in parts {
            current = current.fields.iter().find(|f| f.name == part)?;
        }
        Some(current)
    }

    /// Dotted paths of the primary key fields.
    #[must_use]
    pub fn primary_keys(&self) -> Vec<String> {
        self.flattened_fields()
            .into_iter()
            .filter(|(_, f)| f.primary_key)
            .map(|(path, _)| path)
            .collect()
    }

    /// Identity fields as `(path, identity type)`.
    #[must_use]
    pub fn identity_fields(&self) -> Vec<(String, String)> {
        self.flattened_fields()
            .into_iter()
            .filter_map(|(path, f)| f.identity.clone().map(|identity| (path, identity)))
            .collect()
    }
}

fn flatten_into<'a>(fields: &'a [FieldConfig], prefix: Option<&str>, out: &mut Vec<(String, &'a FieldConfig)>) {
    for field in fields {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{}", field.name),
            None => field.name.clone(),
        };
        flatten_into(&field.fields, Some(&path), out);
        out.push((path, field));
    }
}

/// A dataset: the collections behind one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset name, unique in the active set.
    pub name: String,
    /// Key of the connector that serves this dataset.
    pub connection_key: String,
    /// Collections.
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

impl DatasetConfig {
    /// Creates an empty dataset.
    #[must_use]
    pub fn new(name: impl Into<String>, connection_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_key: connection_key.into(),
            collections: Vec::new(),
        }
    }

    /// Adds a collection.
    #[must_use]
    pub fn with_collection(mut self, collection: CollectionConfig) -> Self {
        self.collections.push(collection);
        self
    }

    /// Looks up a collection by name.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// The address of one of this dataset's collections.
    #[must_use]
    pub fn address(&self, collection: &str) -> CollectionAddress {
        CollectionAddress::new(&self.name, collection)
    }
}
