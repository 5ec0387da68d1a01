//! Keysets and mint keys

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::Amount;
use crate::util::hex;

/// Keyset error
#[derive(Debug, Error)]
pub enum Error {
    /// Keyset id hex is malformed
    #[error("Invalid keyset id: `{0}`")]
    InvalidId(String),
    /// Keyset id length is wrong
    #[error("Keyset id must be {expected} hex chars, got {got}")]
    Length {
        /// Expected number of characters
        expected: usize,
        /// Number of characters seen
        got: usize,
    },
    /// Hex error
    #[error(transparent)]
    Hex(#[from] hex::Error),
}

/// Keyset id: a version byte followed by seven bytes of the keyset's
/// key digest, hex encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; Self::BYTES]);

impl Id {
    const BYTES: usize = 8;
    const STRLEN: usize = 16;
    const VERSION: u8 = 0x00;

    /// Derive the id of a keyset from its ordered keys
    pub fn from_keys(keys: &Keys) -> Self {
        let mut engine = sha256::Hash::engine();
        for (_, pubkey) in keys.iter() {
            bitcoin::hashes::HashEngine::input(&mut engine, &pubkey.serialize());
        }
        let digest = sha256::Hash::from_engine(engine);

        let mut bytes = [0u8; Self::BYTES];
        bytes[0] = Self::VERSION;
        bytes[1..].copy_from_slice(&digest.to_byte_array()[..Self::BYTES - 1]);
        Self(bytes)
    }

    /// Id as raw bytes
    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        self.0
    }
}

impl From<Id> for u32 {
    /// Keyset id as a bip32 child index (big-endian value folded into
    /// the hardened index range)
    fn from(value: Id) -> Self {
        let int = u64::from_be_bytes(value.0);
        (int % (2_u64.pow(31) - 1)) as u32
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::STRLEN {
            return Err(Error::Length {
                expected: Self::STRLEN,
                got: s.len(),
            });
        }
        let bytes = hex::decode(s)?;
        let mut id = [0u8; Self::BYTES];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Mint public keys of a keyset, one per power-of-two amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keys(BTreeMap<Amount, PublicKey>);

impl Keys {
    /// New [`Keys`]
    pub fn new(keys: BTreeMap<Amount, PublicKey>) -> Self {
        Self(keys)
    }

    /// Mint key for the given amount
    pub fn amount_key(&self, amount: Amount) -> Option<PublicKey> {
        self.0.get(&amount).copied()
    }

    /// Iterate (amount, key) in ascending amount order
    pub fn iter(&self) -> impl Iterator<Item = (&Amount, &PublicKey)> {
        self.0.iter()
    }

    /// Largest amount the keyset can sign
    pub fn max_order(&self) -> Option<Amount> {
        self.0.keys().next_back().copied()
    }
}

/// A keyset: id, unit and the keys themselves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// Keyset id
    pub id: Id,
    /// Currency unit the keyset signs for
    pub unit: crate::amount::CurrencyUnit,
    /// Mint public keys
    pub keys: Keys,
}

/// Keyset metadata as advertised by the mint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySetInfo {
    /// Keyset id
    pub id: Id,
    /// Currency unit the keyset signs for
    pub unit: crate::amount::CurrencyUnit,
    /// Whether the mint still signs with this keyset
    pub active: bool,
    /// Input fee in parts-per-thousand per proof spent
    #[serde(default)]
    pub input_fee_ppk: u64,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn id_round_trip() {
        let id = Id::from_str("00deadbeef123456").unwrap();
        assert_eq!(id.to_string(), "00deadbeef123456");
        assert!(Id::from_str("00deadbeef12345").is_err());
        assert!(Id::from_str("zzdeadbeef123456").is_err());
    }

    #[test]
    fn id_is_stable_for_keys() {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let mut map = BTreeMap::new();
        for (amount, byte) in [(1u64, 1u8), (2, 2), (4, 3)] {
            let sk = bitcoin::secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
            map.insert(
                Amount::from(amount),
                bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk),
            );
        }
        let keys = Keys::new(map);
        assert_eq!(Id::from_keys(&keys), Id::from_keys(&keys));
    }
}
