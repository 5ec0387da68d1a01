//! Encoded tokens
//!
//! A token is a portable set of proofs bound to one mint and unit,
//! CBOR-encoded and carried as a `cashuB…` base64url string. The
//! sha256 of that encoded string is the token's identity and the
//! unique key that makes double-claims impossible.

use std::fmt;
use std::str::FromStr;

use bitcoin::base64::engine::{general_purpose, GeneralPurpose};
use bitcoin::base64::{alphabet, Engine as _};
use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::{Amount, CurrencyUnit};
use crate::keyset::Id;
use crate::mint_url::MintUrl;
use crate::proof::{Proof, Proofs};
use crate::secret::Secret;
use crate::util::hex;

const TOKEN_PREFIX: &str = "cashuB";

fn base64_engine() -> GeneralPurpose {
    GeneralPurpose::new(&alphabet::URL_SAFE, general_purpose::NO_PAD)
}

/// Token error
#[derive(Debug, Error)]
pub enum Error {
    /// Not a token this wallet understands
    #[error("Unsupported token")]
    UnsupportedToken,
    /// Base64 error
    #[error(transparent)]
    Base64(#[from] bitcoin::base64::DecodeError),
    /// CBOR encode error
    #[error("CBOR encode error: {0}")]
    CborSer(String),
    /// CBOR decode error
    #[error("CBOR decode error: {0}")]
    CborDe(String),
}

/// Proofs of one keyset inside a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenProofGroup {
    /// Keyset id
    #[serde(rename = "i")]
    keyset_id: Id,
    /// Proofs bound to that keyset
    #[serde(rename = "p")]
    proofs: Vec<TokenProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenProof {
    #[serde(rename = "a")]
    amount: Amount,
    #[serde(rename = "s")]
    secret: Secret,
    #[serde(rename = "c")]
    c: bitcoin::secp256k1::PublicKey,
}

/// An encoded, portable set of proofs with mint url and unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Mint the proofs are redeemable at
    #[serde(rename = "m")]
    mint_url: MintUrl,
    /// Unit of all contained proofs
    #[serde(rename = "u")]
    unit: CurrencyUnit,
    /// Optional memo for the receiver
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    /// Proofs grouped by keyset
    #[serde(rename = "t")]
    token: Vec<TokenProofGroup>,
}

impl Token {
    /// Create a new [`Token`] from ungrouped proofs
    pub fn new(
        mint_url: MintUrl,
        unit: CurrencyUnit,
        proofs: Proofs,
        memo: Option<String>,
    ) -> Self {
        let mut groups: Vec<TokenProofGroup> = Vec::new();
        for proof in proofs {
            let entry = TokenProof {
                amount: proof.amount,
                secret: proof.secret,
                c: proof.c,
            };
            match groups.iter_mut().find(|g| g.keyset_id == proof.keyset_id) {
                Some(group) => group.proofs.push(entry),
                None => groups.push(TokenProofGroup {
                    keyset_id: proof.keyset_id,
                    proofs: vec![entry],
                }),
            }
        }

        Self {
            mint_url,
            unit,
            memo,
            token: groups,
        }
    }

    /// Mint url the token is redeemable at
    pub fn mint_url(&self) -> &MintUrl {
        &self.mint_url
    }

    /// Unit of the contained proofs
    pub fn unit(&self) -> CurrencyUnit {
        self.unit
    }

    /// Memo, if the sender attached one
    pub fn memo(&self) -> Option<&str> {
        self.memo.as_deref()
    }

    /// The contained proofs, ungrouped
    pub fn proofs(&self) -> Proofs {
        self.token
            .iter()
            .flat_map(|group| {
                group.proofs.iter().map(|p| Proof {
                    amount: p.amount,
                    keyset_id: group.keyset_id,
                    secret: p.secret.clone(),
                    c: p.c,
                })
            })
            .collect()
    }

    /// Total value of the token
    pub fn value(&self) -> Amount {
        self.token
            .iter()
            .flat_map(|group| group.proofs.iter().map(|p| p.amount))
            .sum()
    }

    /// The token's unique identity: sha256 of the encoded token, hex.
    pub fn token_hash(&self) -> String {
        token_hash(&self.to_string())
    }
}

/// Hash an already-encoded token string
pub fn token_hash(encoded: &str) -> String {
    hex::encode(sha256::Hash::hash(encoded.as_bytes()).to_byte_array())
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut data = Vec::new();
        ciborium::into_writer(self, &mut data).map_err(|_| fmt::Error)?;
        let encoded = base64_engine().encode(&data);
        write!(f, "{TOKEN_PREFIX}{encoded}")
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(TOKEN_PREFIX).ok_or(Error::UnsupportedToken)?;
        let data = base64_engine().decode(encoded)?;
        ciborium::from_reader(&data[..]).map_err(|e| Error::CborDe(e.to_string()))
    }
}
