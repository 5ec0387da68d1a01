//! Proof secret

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::rand::{self, RngCore};
use serde::{Deserialize, Serialize};

use crate::util::hex;

/// The secret data that allows spending ecash.
///
/// Deterministically derived secrets (the only kind this wallet mints)
/// are the lowercase hex encoding of 32 derived bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create [`Secret`] from a string
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Create a random [`Secret`]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut random_bytes = [0u8; 32];
        rng.fill_bytes(&mut random_bytes);
        Self(hex::encode(random_bytes))
    }

    /// Secret as str
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Secret as bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}
