//! Per-kind attribute schemas.
//!
//! A schema says which attributes cannot change in place (a change forces
//! replacement) and which ones the provider computes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute rules for one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSchema {
    /// Resource kind.
    pub kind: String,
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub immutable: Vec<String>,
    /// Attributes assigned by the provider.
    #[serde(default)]
    pub computed: Vec<String>,
}

/// Built-in schemas: (kind, immutable attributes, computed attributes).
const BUILTIN_SCHEMAS: &[(&str, &[&str], &[&str])] = &[
    ("network", &["cidr_block"], &[]),
    ("subnet", &["network_id", "cidr_block", "availability_zone"], &[]),
    ("internet_gateway", &["network_id"], &[]),
    ("route_table", &["network_id"], &[]),
    ("route_table_association", &["subnet_id", "route_table_id"], &[]),
    ("security_group", &["network_id", "name"], &[]),
    ("key_pair", &["key_name", "public_key"], &["fingerprint"]),
    (
        "instance",
        &["image", "subnet_id", "key_name", "user_data", "availability_zone"],
        &["public_ip", "private_ip"],
    ),
];

impl KindSchema {
    /// Returns true if changing `attribute` forces replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.iter().any(|a| a == attribute)
    }

    /// Returns true if the provider assigns `attribute`.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        attribute == "id" || self.computed.iter().any(|a| a == attribute)
    }
}

/// Schemas keyed by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, KindSchema>,
}

impl SchemaRegistry {
    /// Returns the built-in schemas.
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_schemas(BUILTIN_SCHEMAS.iter().map(|(kind, immutable, computed)| KindSchema {
            kind: (*kind).to_string(),
            immutable: immutable.iter().map(|s| (*s).to_string()).collect(),
            computed: computed.iter().map(|s| (*s).to_string()).collect(),
        }))
    }

    /// Builds a registry from a list of schemas. Later entries win.
    #[must_use]
    pub fn from_schemas(schemas: impl IntoIterator<Item = KindSchema>) -> Self {
        Self {
            schemas: schemas.into_iter().map(|s| (s.kind.clone(), s)).collect(),
        }
    }

    /// Adds or replaces schemas from another registry.
    pub fn merge(&mut self, other: Self) {
        self.schemas.extend(other.schemas);
    }

    /// Looks up the schema for a kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&KindSchema> {
        self.schemas.get(kind)
    }

    /// Returns true if the kind is known.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    /// Returns the known kinds in name order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Returns true if `attribute` of `kind` is immutable. Unknown kinds have
    /// no immutable attributes.
    #[must_use]
    pub fn is_immutable(&self, kind: &str, attribute: &str) -> bool {
        self.get(kind).is_some_and(|s| s.is_immutable(attribute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = SchemaRegistry::builtin();
        let kinds: Vec<&str> = registry.kinds().collect();

        assert_eq!(kinds.len(), 8);
        assert!(registry.contains("route_table_association"));
        assert!(registry.is_immutable("subnet", "cidr_block"));
        assert!(!registry.is_immutable("security_group", "ingress"));
        assert!(!registry.is_immutable("unknown", "anything"));
    }

    #[test]
    fn test_merge_overrides_builtin() {
        let mut registry = SchemaRegistry::builtin();
        registry.merge(SchemaRegistry::from_schemas([KindSchema {
            kind: String::from("instance"),
            immutable: vec![String::from("image")],
            computed: Vec::new(),
        }]));

        assert!(registry.is_immutable("instance", "image"));
        assert!(!registry.is_immutable("instance", "user_data"));
        let instance = registry.get("instance").expect("instance schema");
        assert!(instance.is_computed("id"));
    }
}
