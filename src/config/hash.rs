//! Fingerprinting for change detection.
//!
//! A module's fingerprint is a SHA-256 over its kind and the canonical JSON
//! of its resolved inputs. Object keys are sorted before hashing, so two
//! input sets with the same content always produce the same fingerprint.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::spec::KeelConfig;

/// Hasher for computing input fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fingerprinter;

impl Fingerprinter {
    /// Creates a new fingerprinter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a module's resolved inputs.
    #[must_use]
    pub fn fingerprint(&self, kind: &str, inputs: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();

        hasher.update(kind.as_bytes());
        hasher.update([0u8]);

        for (key, value) in inputs {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            let mut canonical = String::new();
            write_canonical(value, &mut canonical);
            hasher.update(canonical.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the whole configuration document.
    ///
    /// Shown alongside plans so operators can tell which revision produced them.
    #[must_use]
    pub fn hash_config(&self, config: &KeelConfig) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(config) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(config.project.name.as_bytes()),
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two fingerprints.
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

/// Writes compact JSON with object keys in sorted order.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
