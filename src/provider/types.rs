//! Provider request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attributes sent to the provider for a create or update.
///
/// References are already resolved to concrete values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequest {
    /// Resource kind.
    pub kind: String,
    /// Logical name, passed along so the provider can tag the resource.
    pub name: String,
    /// Concrete attribute values.
    pub attributes: BTreeMap<String, Value>,
}

/// A resource as the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Every attribute the provider knows, computed ones included.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl ProviderResource {
    /// Returns the attributes with `id` included, as stored in state.
    #[must_use]
    pub fn into_state_attributes(self) -> BTreeMap<String, Value> {
        let mut attributes = self.attributes;
        attributes.insert(String::from("id"), Value::String(self.id));
        attributes
    }
}
