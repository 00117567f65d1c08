use crate::error::{FairlogError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const DIGEST_LEN: usize = 32;

/// A fixed-length 32-byte hash output. Serialized as `0x`-prefixed lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; DIGEST_LEN]);

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = decode_hex(s)?;
        let arr: [u8; DIGEST_LEN] = bytes.as_slice().try_into().map_err(|_| {
            FairlogError::Malformed(format!(
                "digest is {} bytes, expected {DIGEST_LEN}",
                bytes.len()
            ))
        })?;
        Ok(Digest(arr))
    }

    /// Copy with a single bit flipped. Used to build tampered fixtures.
    pub fn with_bit_flipped(&self, bit: usize) -> Self {
        let mut out = self.0;
        out[(bit / 8) % DIGEST_LEN] ^= 1 << (bit % 8);
        Digest(out)
    }

    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect::<String>() + "..."
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// `0x`-prefixed lowercase hex.
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode hex with or without a `0x` prefix.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let clean = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(clean).map_err(|e| FairlogError::Malformed(format!("invalid hex: {e}")))
}

/// Decode hex into an exact-length array.
pub fn decode_hex_array<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let bytes = decode_hex(s)?;
    bytes.as_slice().try_into().map_err(|_| {
        FairlogError::Malformed(format!("{what} is {} bytes, expected {N}", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_accepts_optional_prefix() {
        let d = Digest([0xab; 32]);
        assert_eq!(Digest::from_hex(&d.to_hex()).unwrap(), d);
        assert_eq!(Digest::from_hex(&"ab".repeat(32)).unwrap(), d);
    }

    #[test]
    fn wrong_length_is_malformed() {
        let err = Digest::from_hex("0xabcd").unwrap_err();
        assert!(matches!(err, FairlogError::Malformed(_)));
        assert!(decode_hex("0xzz").is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let d = Digest([1u8; 32]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "01".repeat(32)));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"0x01\"").is_err());
    }

    #[test]
    fn bit_flip_changes_exactly_one_bit() {
        let d = Digest::ZERO.with_bit_flipped(9);
        assert_eq!(d.0[1], 0b10);
        assert_eq!(d.0.iter().filter(|b| **b != 0).count(), 1);
    }
}
