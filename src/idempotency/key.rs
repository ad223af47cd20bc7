use crate::error::IdempotencyViolation;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::{Uuid, Variant};

/// A caller-supplied idempotency key that parsed as an RFC 4122 version-4 UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey {
    raw: String,
    uuid: Uuid,
}

impl IdempotencyKey {
    /// Validates a raw header value.
    ///
    /// Anything that is not a parseable UUID, or a UUID whose version nibble
    /// is not 4 or whose variant is not RFC 4122, is rejected.
    pub fn parse(raw: &str) -> Result<Self, IdempotencyViolation> {
        let raw = raw.trim();
        let uuid = Uuid::parse_str(raw).map_err(|_| IdempotencyViolation::InvalidKey)?;

        if uuid.get_version_num() != 4 || uuid.get_variant() != Variant::RFC4122 {
            return Err(IdempotencyViolation::InvalidKey);
        }

        Ok(Self {
            raw: raw.to_string(),
            uuid,
        })
    }

    /// The key as the caller sent it, minus surrounding whitespace.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl TryFrom<&str> for IdempotencyKey {
    type Error = IdempotencyViolation;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Address of a record in the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives cache keys from the caller's credential and idempotency key.
///
/// Two tenants sending the same idempotency key land on different cache keys.
/// The credential never appears in clear text in the store.
#[derive(Debug, Clone)]
pub struct CacheKeyGenerator {
    key_prefix: String,
}

impl CacheKeyGenerator {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn derive(&self, credential: Option<&str>, key: &IdempotencyKey) -> CacheKey {
        let mut hasher = Sha256::new();

        match credential {
            Some(token) => {
                hasher.update(b"bearer:");
                hasher.update(token.as_bytes());
            }
            None => hasher.update(b"anonymous"),
        }

        // '|' is outside the bearer token alphabet
        hasher.update(b"|");
        hasher.update(key.uuid().as_hyphenated().to_string().as_bytes());

        let hash_hex = hex::encode(hasher.finalize());

        CacheKey(format!("{}_{}", self.key_prefix, hash_hex))
    }
}

impl Default for CacheKeyGenerator {
    fn default() -> Self {
        Self::new("idem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V4: &str = "9b2f3c1e-4d5a-4f6b-8c7d-0e1f2a3b4c5d";

    #[test]
    fn test_accepts_v4_uuid() {
        let key = IdempotencyKey::parse(V4).unwrap();
        assert_eq!(key.as_str(), V4);
        assert_eq!(key.uuid().get_version_num(), 4);
    }

    #[test]
    fn test_accepts_generated_keys() {
        for _ in 0..16 {
            let raw = Uuid::new_v4().to_string();
            assert!(IdempotencyKey::parse(&raw).is_ok());
        }
    }

    #[test]
    fn test_rejects_garbage() {
        for raw in ["", "fake-idempotency-key", "1234", "9b2f3c1e-4d5a-4f6b-8c7d"] {
            assert_eq!(
                IdempotencyKey::parse(raw),
                Err(IdempotencyViolation::InvalidKey),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_other_versions() {
        // v1
        assert!(IdempotencyKey::parse("6ba7b810-9dad-11d1-80b4-00c04fd430c8").is_err());
        // v5
        assert!(IdempotencyKey::parse("886313e1-3b8a-5372-9b90-0c9aee199e5d").is_err());
        // nil
        assert!(IdempotencyKey::parse("00000000-0000-0000-0000-000000000000").is_err());
    }

    #[test]
    fn test_rejects_non_rfc4122_variant() {
        // version nibble 4, variant bits 110x (Microsoft)
        assert!(IdempotencyKey::parse("9b2f3c1e-4d5a-4f6b-cc7d-0e1f2a3b4c5d").is_err());
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let generator = CacheKeyGenerator::default();
        let key = IdempotencyKey::parse(V4).unwrap();

        let a = generator.derive(Some("token-a"), &key);
        let b = generator.derive(Some("token-a"), &key);

        assert_eq!(a, b);
        assert!(a.as_str().starts_with("idem_"));
        assert!(!a.as_str().contains("token-a"));
    }

    #[test]
    fn test_cache_key_isolates_credentials() {
        let generator = CacheKeyGenerator::new("test");
        let key = IdempotencyKey::parse(V4).unwrap();

        let tenant_a = generator.derive(Some("token-a"), &key);
        let tenant_b = generator.derive(Some("token-b"), &key);
        let anonymous = generator.derive(None, &key);

        assert_ne!(tenant_a, tenant_b);
        assert_ne!(tenant_a, anonymous);
    }

    #[test]
    fn test_cache_key_ignores_uuid_spelling() {
        let generator = CacheKeyGenerator::default();
        let lower = IdempotencyKey::parse(V4).unwrap();
        let upper = IdempotencyKey::parse(&V4.to_uppercase()).unwrap();

        assert_eq!(generator.derive(None, &lower), generator.derive(None, &upper));
        assert_ne!(lower.as_str(), upper.as_str());
    }
}
