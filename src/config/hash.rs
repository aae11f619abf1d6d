//! Declaration hashing for change detection.
//!
//! Hashes are computed over the declared (unresolved) form of a resource so
//! that the same declarations always produce the same hash, regardless of
//! what the provider assigned on a previous run.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::graph::{Resource, ResourceGraph};

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole graph, outputs and renders included.
    #[must_use]
    pub fn hash_graph(&self, graph: &ResourceGraph) -> String {
        let mut hasher = Sha256::new();

        for resource in graph.resources() {
            hasher.update(resource.id.to_string().as_bytes());
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        for output in graph.outputs() {
            hasher.update(output.name.as_bytes());
            hasher.update(output.value.as_bytes());
        }

        for render in graph.renders() {
            hasher.update(render.name.as_bytes());
            hasher.update(render.path.to_string_lossy().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of one resource's declared attributes.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hash_attributes(&resource.attributes).as_bytes());

        // depends_on only affects ordering and is left out.
        let mut lifecycle = resource.replace_on_change.clone();
        lifecycle.sort_unstable();
        for attribute in lifecycle {
            hasher.update(attribute.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of an attribute map.
    ///
    /// `BTreeMap` keys and `serde_json` objects both serialize in sorted key
    /// order, so the JSON encoding is canonical.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
