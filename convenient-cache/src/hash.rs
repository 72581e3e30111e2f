//! SHA256-based fingerprints: file content hashes and rule keys

use crate::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;

fn parse_digest(hex_str: &str) -> CacheResult<[u8; 32]> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut bytes).map_err(|_| CacheError::InvalidHash(hex_str.to_string()))?;
    Ok(bytes)
}

/// SHA256 of a file's contents
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Parse a 64 character hex string
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidHash` if the hash is not a valid SHA256 hex string
    pub fn from_hex(hash: &str) -> CacheResult<Self> {
        parse_digest(hash).map(Self)
    }

    /// Hash in-memory content
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Hash a file, streaming its contents
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let _ = io::copy(&mut file, &mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl TryFrom<String> for ContentHash {
    type Error = CacheError;

    fn try_from(value: String) -> CacheResult<Self> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_string()
    }
}

/// Fingerprint of a rule: its configuration, input contents and dependency keys.
///
/// Produced by the engine's rule key builders; the cache only stores and
/// compares them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleKey([u8; 32]);

impl RuleKey {
    /// Wrap a finished SHA256 digest
    #[must_use]
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// Parse a 64 character hex string
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidHash` for anything else
    pub fn from_hex(key: &str) -> CacheResult<Self> {
        parse_digest(key).map(Self)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleKey({self})")
    }
}

impl FromStr for RuleKey {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        Self::from_hex(s.trim())
    }
}

impl TryFrom<String> for RuleKey {
    type Error = CacheError;

    fn try_from(value: String) -> CacheResult<Self> {
        Self::from_hex(&value)
    }
}

impl From<RuleKey> for String {
    fn from(value: RuleKey) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_known_value() {
        let hash = ContentHash::from_content(b"");
        assert_eq!(
            hash.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_content_hash_validation() {
        assert!(ContentHash::from_hex(&"a".repeat(64)).is_ok());
        assert!(ContentHash::from_hex(&"a".repeat(63)).is_err());
        assert!(ContentHash::from_hex(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_file_hash_matches_content_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"test content").unwrap();
        assert_eq!(ContentHash::from_file(&path).unwrap(), ContentHash::from_content(b"test content"));
    }

    #[test]
    fn test_rule_key_serde_is_hex_string() {
        let key = RuleKey::from_digest([0xab; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: RuleKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<RuleKey>("\"nothex\"").is_err());
    }

    #[test]
    fn test_rule_key_from_str_trims() {
        let text = format!("{}\n", "01".repeat(32));
        let key: RuleKey = text.parse().unwrap();
        assert_eq!(key.as_bytes()[0], 1);
    }
}
