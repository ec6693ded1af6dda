//! Content digest engine.
//!
//! Stage cache keys are SHA-256 digests over an ordered list of string parts.
//! Each part is length-prefixed before hashing so that part boundaries are
//! unambiguous: `("ab", "c")` and `("a", "bc")` produce different digests.

use crate::error::{Result, StagecraftError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;

/// Length of a digest in hex characters (SHA-256).
pub const DIGEST_HEX_LEN: usize = 64;

/// An opaque content-derived cache key. Never mutated after computation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Digest(String);

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Validate on the way in so a corrupt record cannot smuggle in a
        // malformed digest.
        let value = String::deserialize(deserializer)?;
        Digest::parse(&value).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    /// Computes the digest of an ordered list of parts.
    ///
    /// Pure function: equal inputs always produce equal digests, and no
    /// hidden inputs (time, pid, iteration order) participate. Callers are
    /// responsible for flattening map-valued fields in sorted key order.
    pub fn compute<S: AsRef<str>>(parts: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            let bytes = part.as_ref().as_bytes();
            // 8-byte big-endian length prefix delimits each part.
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        Digest(format!("{:x}", hasher.finalize()))
    }

    /// Computes the digest of a raw byte buffer (used for file contents).
    pub fn compute_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(format!("{:x}", hasher.finalize()))
    }

    /// Parses a previously computed digest from its hex representation.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != DIGEST_HEX_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StagecraftError::InvalidDigest { value: value.to_string() });
        }
        Ok(Digest(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}
