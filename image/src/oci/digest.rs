//! Content addressing helpers.
//!
//! Every blob and JSON document is identified by `sha256:<hex>` over its exact
//! serialized bytes.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use hoist_core::error::{HoistError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// The only digest algorithm hoist produces or accepts.
pub const SHA256: &str = "sha256";

/// A validated `sha256:<64 hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Build a digest from a finalized SHA-256 hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Algorithm part (always `sha256`).
    pub fn algorithm(&self) -> &'static str {
        SHA256
    }

    /// Hex-encoded hash without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// File name used for this blob in a folder endpoint (`sha256_<hex>`).
    pub fn file_name(&self) -> String {
        format!("{}_{}", SHA256, self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SHA256, self.hex)
    }
}

impl FromStr for Digest {
    type Err = HoistError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| HoistError::Parse(format!("digest '{}' has no algorithm", s)))?;
        if algorithm != SHA256 {
            return Err(HoistError::Parse(format!(
                "unsupported digest algorithm '{}'",
                algorithm
            )));
        }
        let valid = hex.len() == 64
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(HoistError::Parse(format!("malformed sha256 digest '{}'", s)));
        }
        Ok(Self {
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_hasher(hasher)
}

/// Compute the digest and length of everything readable from `reader`.
pub fn sha256_reader<R: Read>(mut reader: R) -> Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Digest::from_hasher(hasher), total))
}

/// Serialize a document to the exact bytes that get hashed and uploaded.
///
/// Compact output; struct fields keep declaration order and maps are
/// `BTreeMap`-backed, so equal values always produce equal bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// `Write` adapter that hashes and counts every byte on its way to `inner`.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Finalize the hash and hand back the inner writer.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_bytes() {
        let digest = sha256_bytes(b"hello");
        assert_eq!(digest.hex(), HELLO);
        assert_eq!(digest.to_string(), format!("sha256:{}", HELLO));
    }

    #[test]
    fn test_sha256_reader() {
        let (digest, size) = sha256_reader(&b"hello"[..]).unwrap();
        assert_eq!(digest.hex(), HELLO);
        assert_eq!(size, 5);
    }

    #[test]
    fn test_parse_roundtrip() {
        let s = format!("sha256:{}", HELLO);
        let digest: Digest = s.parse().unwrap();
        assert_eq!(digest.to_string(), s);
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.file_name(), format!("sha256_{}", HELLO));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("abc".parse::<Digest>().is_err());
        assert!("sha512:abcd".parse::<Digest>().is_err());
        assert!("sha256:abcd".parse::<Digest>().is_err());
        assert!(format!("sha256:{}", HELLO.to_uppercase())
            .parse::<Digest>()
            .is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let digest = sha256_bytes(b"hello");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{}\"", HELLO));
        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_hashing_writer() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hel").unwrap();
        writer.write_all(b"lo").unwrap();
        let (inner, digest, size) = writer.finish();
        assert_eq!(inner, b"hello");
        assert_eq!(digest.hex(), HELLO);
        assert_eq!(size, 5);
    }

    #[test]
    fn test_canonical_json_sorted_maps() {
        let mut a = std::collections::BTreeMap::new();
        a.insert("b", 1);
        a.insert("a", 2);
        assert_eq!(canonical_json(&a).unwrap(), br#"{"a":2,"b":1}"#.to_vec());
    }
}
