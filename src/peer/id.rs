//! Peer identifiers
//!
//! A `PeerId` is a random 128-bit node identity that doubles as a point in
//! the XOR metric space: `distance(a, b) = a ^ b`, ordered as an unsigned
//! integer.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::BitXor;

/// Encoded size of an id on the wire
pub const ID_BYTES: usize = 16;

/// Number of hex digits shown by `PeerId::short`
const SHORT_HEX_DIGITS: usize = 4;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u128);

impl PeerId {
    /// The unset id carried by peers that have not completed a handshake
    pub const ZERO: PeerId = PeerId(0);

    pub const BITS: u32 = u128::BITS;

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// A fresh random id, never zero
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id = Self(rng.gen());
            if !id.is_zero() {
                return id;
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// XOR distance to `other`
    pub fn distance(&self, other: &PeerId) -> u128 {
        self.0 ^ other.0
    }

    pub fn to_bytes(self) -> [u8; ID_BYTES] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// Most significant digit first
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse a hex id written most significant digit first. Short inputs are
    /// padded on the right, so `"ab"` is `0xab00..00`.
    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        let digits = value.trim();
        if digits.len() > ID_BYTES * 2 {
            return Err(hex::FromHexError::InvalidStringLength);
        }

        let mut padded = digits.to_string();
        while padded.len() < ID_BYTES * 2 {
            padded.push('0');
        }

        let mut bytes = [0u8; ID_BYTES];
        hex::decode_to_slice(&padded, &mut bytes)?;
        Ok(Self(u128::from_be_bytes(bytes)))
    }

    /// First four hex digits, used in logs
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(SHORT_HEX_DIGITS);
        hex
    }
}

impl BitXor for PeerId {
    type Output = PeerId;

    fn bitxor(self, rhs: PeerId) -> PeerId {
        PeerId(self.0 ^ rhs.0)
    }
}

impl From<u128> for PeerId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        PeerId::from_hex(&value).map_err(serde::de::Error::custom)
    }
}
