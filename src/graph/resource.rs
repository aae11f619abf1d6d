//! Resource identity and loaded resource nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::expr::AttributeRef;

/// Identity of a resource: its kind and logical name, written `kind.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource kind.
    pub kind: String,
    /// Logical name, unique per kind.
    pub name: String,
}

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parses a `kind.name` address.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if either part is missing.
    pub fn parse(address: &str) -> Result<Self, String> {
        match address.split_once('.') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Self::new(kind, name))
            }
            _ => Err(format!("invalid resource address '{address}', expected kind.name")),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// Where a declaration was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Document label (path relative to the workspace when possible).
    pub file: String,
    /// Index in the document's `resources` (or `outputs`/`renders`) list.
    pub index: usize,
    /// Which list the declaration lives in.
    pub section: &'static str,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}[{}]", self.file, self.section, self.index)
    }
}

/// A loaded resource: variables substituted, references still symbolic.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Identity.
    pub id: ResourceId,
    /// Declared attributes, including file payloads.
    pub attributes: BTreeMap<String, Value>,
    /// Explicit `depends_on` entries.
    pub depends_on: Vec<ResourceId>,
    /// Attribute references, paired with the attribute that holds them.
    pub references: Vec<(String, AttributeRef)>,
    /// Attributes whose change forces replacement.
    pub replace_on_change: Vec<String>,
    /// Declaration site.
    pub location: SourceLocation,
}

impl Resource {
    /// Returns every resource this one depends on, first-seen order, no repeats.
    #[must_use]
    pub fn dependencies(&self) -> Vec<ResourceId> {
        let mut seen = Vec::new();
        let referenced = self.references.iter().map(|(_, r)| &r.target);
        for id in referenced.chain(self.depends_on.iter()) {
            if !seen.contains(id) {
                seen.push(id.clone());
            }
        }
        seen
    }

    /// Returns the attributes that reference `target`.
    #[must_use]
    pub fn attributes_referencing(&self, target: &ResourceId) -> Vec<&str> {
        let mut attributes: Vec<&str> = Vec::new();
        for (attribute, reference) in &self.references {
            if &reference.target == target && !attributes.contains(&attribute.as_str()) {
                attributes.push(attribute);
            }
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(kind: &str, name: &str, attribute: &str) -> AttributeRef {
        AttributeRef {
            target: ResourceId::new(kind, name),
            attribute: attribute.to_string(),
        }
    }

    #[test]
    fn test_resource_id_parse_and_display() {
        let id = ResourceId::parse("subnet.public").expect("valid address");
        assert_eq!(id, ResourceId::new("subnet", "public"));
        assert_eq!(id.to_string(), "subnet.public");

        assert!(ResourceId::parse("subnet").is_err());
        assert!(ResourceId::parse(".public").is_err());
        assert!(ResourceId::parse("a.b.c").is_err());
    }

    #[test]
    fn test_resource_id_serializes_as_address() {
        let id = ResourceId::new("network", "main");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"network.main\"");

        let back: ResourceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn test_dependencies_are_unique() {
        let resource = Resource {
            id: ResourceId::new("route_table_association", "public"),
            attributes: BTreeMap::new(),
            depends_on: vec![ResourceId::new("internet_gateway", "main")],
            references: vec![
                (String::from("subnet_id"), reference("subnet", "public", "id")),
                (String::from("route_table_id"), reference("route_table", "public", "id")),
                (String::from("tags"), reference("subnet", "public", "cidr_block")),
            ],
            replace_on_change: Vec::new(),
            location: SourceLocation {
                file: String::from("main.yaml"),
                index: 4,
                section: "resources",
            },
        };

        let deps: Vec<String> = resource.dependencies().iter().map(ToString::to_string).collect();
        assert_eq!(
            deps,
            vec!["subnet.public", "route_table.public", "internet_gateway.main"]
        );
        assert_eq!(
            resource.attributes_referencing(&ResourceId::new("subnet", "public")),
            vec!["subnet_id", "tags"]
        );
        assert_eq!(resource.location.to_string(), "main.yaml: resources[4]");
    }
}
