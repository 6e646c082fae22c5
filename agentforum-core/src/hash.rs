use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 32-byte BLAKE3 hash identifying a message (or any other canonically
/// encoded record, such as a cache fingerprint).
///
/// Hashes are serialized as CBOR byte strings (major type 2), not as arrays,
/// and displayed as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HashVisitor;

        impl serde::de::Visitor<'_> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("32-byte hash")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Hash::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &"32 bytes"))
            }
        }

        deserializer.deserialize_bytes(HashVisitor)
    }
}

impl Hash {
    /// Hashes raw bytes.
    pub fn from_data(data: &[u8]) -> Self {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// Hashes the canonical CBOR encoding of a value.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Self {
        Self::from_data(&encode(value))
    }

    /// Wraps raw hash bytes without hashing them.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Wraps a slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines and compact listings.
    pub fn short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

/// Encodes a value as CBOR.
///
/// Struct fields are emitted in declaration order and `BTreeMap` keys in
/// sorted order, which is what makes the encoding canonical for the types in
/// this crate.
pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).expect("CBOR encoding into a Vec should not fail");
    buf
}

/// Error returned when parsing a [`Hash`] from hex.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ParseHashError(#[from] hex::FromHexError);

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_deterministic() {
        let h1 = Hash::from_data(b"hello world");
        let h2 = Hash::from_data(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_different_data() {
        assert_ne!(Hash::from_data(b"hello"), Hash::from_data(b"world"));
    }

    #[test]
    fn hex_roundtrip() {
        let h = Hash::from_data(b"test");
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<Hash>().unwrap(), h);
    }

    #[test]
    fn known_answer() {
        let h = Hash::from_data(b"hello world");
        assert_eq!(
            h.to_string(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<Hash>(),
            Err(ParseHashError(hex::FromHexError::OddLength))
        );
        assert_eq!(
            "abcd".parse::<Hash>(),
            Err(ParseHashError(hex::FromHexError::InvalidStringLength))
        );
        let bad = "z".repeat(64);
        assert_eq!(
            bad.parse::<Hash>(),
            Err(ParseHashError(hex::FromHexError::InvalidHexCharacter { c: 'z', index: 0 }))
        );
    }

    #[test]
    fn cbor_encodes_as_byte_string() {
        let h = Hash::from_data(b"bytes");
        let bytes = encode(&h);
        // 0x58 = byte string with one-byte length, 0x20 = 32
        assert_eq!(&bytes[..2], &[0x58, 0x20]);
        let back: Hash = ciborium::from_reader(&bytes[..]).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn short_prefix() {
        let h = Hash::from_data(b"short");
        assert!(h.to_string().starts_with(&h.short()));
        assert_eq!(h.short().len(), 8);
    }
}
