//! Content fingerprinting using SHA-256
//!
//! A fingerprint is derived deterministically from file bytes: two peers
//! hashing identical content always produce the same identifier.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Content fingerprint (32 bytes, SHA-256 of the file bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hash a byte slice and return its fingerprint
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to the canonical hex string form used on the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Verify that data matches this fingerprint
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::hash(data) == *self
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Serialized as the hex string so wire payloads stay human-readable.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Incremental hasher for large files
pub struct FingerprintHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl FingerprintHasher {
    /// Create a new incremental hasher
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    /// Update with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Finalize and get the fingerprint
    pub fn finalize(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }

    /// Get bytes processed so far
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fingerprint a file on disk in chunks, returning the fingerprint and the
/// total byte count.
pub async fn fingerprint_file(path: &Path) -> std::io::Result<(Fingerprint, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = FingerprintHasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let size = hasher.bytes_processed();
    Ok((hasher.finalize(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fingerprint_deterministic() {
        let data = b"peer to peer file sharing";
        let a = Fingerprint::hash(data);
        let b = Fingerprint::hash(data);

        assert_eq!(a, b);
        assert!(a.verify(data));
        assert!(!a.verify(b"different bytes"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let fp = Fingerprint::hash(b"some content");

        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex).unwrap(), fp);

        assert!(Fingerprint::from_hex("deadbeef").is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let fp = Fingerprint::hash(b"wire form");
        let json = serde_json::to_string(&fp).unwrap();

        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = b"a longer message, hashed in several uneven pieces";

        let oneshot = Fingerprint::hash(data);

        let mut hasher = FingerprintHasher::new();
        hasher.update(&data[..7]);
        hasher.update(&data[7..30]);
        hasher.update(&data[30..]);
        assert_eq!(hasher.bytes_processed(), data.len() as u64);
        assert_eq!(hasher.finalize(), oneshot);
    }

    #[tokio::test]
    async fn test_fingerprint_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let content = vec![0xabu8; 200_000];
        tmp.write_all(&content).unwrap();
        tmp.flush().unwrap();

        let (fp, size) = fingerprint_file(tmp.path()).await.unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(fp, Fingerprint::hash(&content));
    }
}
