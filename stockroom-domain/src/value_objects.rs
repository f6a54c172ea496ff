//! Value Objects for the Stockroom domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Idempotency key missing or blank
    #[error("Idempotency key is required")]
    IdempotencyKeyRequired,

    /// Idempotency key longer than the allowed maximum
    #[error("Idempotency key is too long: {len} chars (max {max})")]
    IdempotencyKeyTooLong {
        /// Length of the rejected key
        len: usize,
        /// Maximum accepted length
        max: usize,
    },

    /// Fingerprint text is not a 32-byte hex digest
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// Amount must be positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Order input rejected (unknown variant, bad quantity, currency mismatch)
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Customer or address input rejected
    #[error("Invalid customer: {0}")]
    InvalidCustomer(String),

    /// Unknown enum value read back from storage
    #[error("Invalid value for {field}: {value}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Offending value
        value: String,
    },
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Fixed-width SHA-256 digest of the semantically meaningful fields of a
/// mutation request.
///
/// Hex encoded whenever it leaves the process (storage, JSON, logs).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest length in bytes
    pub const LEN: usize = 32;

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation (64 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded =
            hex::decode(s.trim()).map_err(|e| DomainError::InvalidFingerprint(e.to_string()))?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|v: Vec<u8>| {
            DomainError::InvalidFingerprint(format!("invalid length: {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// IdempotencyKey
// =============================================================================

/// Client-supplied idempotency token
///
/// # Invariants
/// - Surrounding whitespace is trimmed
/// - Non-empty after trimming
/// - At most `IdempotencyKey::MAX_LEN` characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum accepted key length
    pub const MAX_LEN: usize = 128;

    /// Parse a raw header value
    ///
    /// # Errors
    /// - `IdempotencyKeyRequired` if the value is absent or blank
    /// - `IdempotencyKeyTooLong` if it exceeds `MAX_LEN` chars
    pub fn parse(raw: Option<&str>) -> Result<Self, DomainError> {
        let key = raw.map(str::trim).unwrap_or_default();
        if key.is_empty() {
            return Err(DomainError::IdempotencyKeyRequired);
        }
        let len = key.chars().count();
        if len > Self::MAX_LEN {
            return Err(DomainError::IdempotencyKeyTooLong { len, max: Self::MAX_LEN });
        }
        Ok(Self(key.to_string()))
    }

    /// Key as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Email
// =============================================================================

/// Normalized customer email (trimmed, lowercase)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Email(String);

impl Email {
    /// Parse and normalize an email address
    ///
    /// Only checks the `local@domain.tld` shape; deliverability is not our
    /// concern.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let email = raw.trim().to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && domain.contains('.')
                    && !domain.contains('@')
                    && !email.contains(char::is_whitespace)
            },
            None => false,
        };
        if !valid {
            return Err(DomainError::InvalidCustomer(format!("invalid email: {}", raw.trim())));
        }
        Ok(Self(email))
    }

    /// Email as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
