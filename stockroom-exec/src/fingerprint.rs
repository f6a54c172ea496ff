//! Request fingerprinting.
//!
//! A fingerprint is a SHA-256 digest over an ordered list of fields. Each
//! field is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` hash
//! differently. JSON payloads are canonicalised first: object keys are
//! sorted and insignificant whitespace is dropped. Callers hashing envelopes
//! that carry transport metadata can opt into dropping volatile keys
//! (timestamps, request/trace ids) with [`FingerprintBuilder::stable_json`].

use serde_json::Value;
use sha2::{Digest, Sha256};
use stockroom_domain::Fingerprint;

/// Keys whose values never take part in a fingerprint
const VOLATILE_KEYS: &[&str] = &["timestamp", "request_id", "trace_id"];

fn is_volatile_key(key: &str) -> bool {
    key.ends_with("_at") || VOLATILE_KEYS.contains(&key)
}

/// Fingerprint an ordered sequence of fields.
pub fn fingerprint<I, F>(fields: I) -> Fingerprint
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    fields.into_iter().fold(FingerprintBuilder::new(), |b, f| b.field(f)).finish()
}

/// Incremental fingerprint construction.
///
/// ```rust
/// use stockroom_exec::FingerprintBuilder;
/// use serde_json::json;
///
/// let a = FingerprintBuilder::new()
///     .field("storefront_order")
///     .json(&json!({"qty": 1, "sku": "MUG"}))
///     .finish();
/// let b = FingerprintBuilder::new()
///     .field("storefront_order")
///     .json(&json!({"sku": "MUG", "qty": 1}))
///     .finish();
/// assert_eq!(a, b);
/// ```
#[derive(Clone, Default)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    /// Start an empty fingerprint
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one length-prefixed field
    pub fn field(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Append a JSON payload in canonical form
    pub fn json(self, value: &Value) -> Self {
        let canonical = canonical_json(value);
        self.field(canonical)
    }

    /// Append a JSON payload in canonical form, volatile keys removed
    pub fn stable_json(self, value: &Value) -> Self {
        let canonical = stable_json(value);
        self.field(canonical)
    }

    /// Finish and return the digest
    pub fn finish(self) -> Fingerprint {
        Fingerprint::from_bytes(self.hasher.finalize().into())
    }
}

/// Canonical JSON text: sorted object keys, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &|_: &str| true, &mut out);
    out
}

/// [`canonical_json`] with volatile keys removed at every level.
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &|key: &str| !is_volatile_key(key), &mut out);
    out
}

fn write_canonical(value: &Value, keep: &dyn Fn(&str) -> bool, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| keep(k)).collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], keep, out);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, keep, out);
            }
            out.push(']');
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}
