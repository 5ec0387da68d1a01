//! Encrypted record codec
//!
//! Sensitive record content is persisted as an opaque ciphertext blob;
//! only indexable fields (ids, hashes, state tags, versions) are stored
//! in the clear. The cipher itself is supplied by the host application
//! and treated as an opaque seal/open pair. Decryption is always
//! followed by a strict schema parse and cross-field validation; a
//! failure there is a fatal corruption, never silently healed.

use std::fmt;
use std::sync::Arc;

use bitcoin::base64::engine::{general_purpose, GeneralPurpose};
use bitcoin::base64::{alphabet, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;

fn base64_engine() -> GeneralPurpose {
    GeneralPurpose::new(&alphabet::URL_SAFE, general_purpose::NO_PAD)
}

/// Cipher error
#[derive(Debug, Error)]
pub enum CipherError {
    /// Ciphertext failed to authenticate or decrypt
    #[error("Cipher open failed: {0}")]
    Open(String),
    /// Plaintext could not be sealed
    #[error("Cipher seal failed: {0}")]
    Seal(String),
}

/// An opaque at-rest cipher.
///
/// The production implementation is an ECIES envelope (seal to the
/// user's public key, open with the private key), injected by the host.
/// Implementations sealing a batch may share one ephemeral key across
/// the batch; that links the batch's records to an observer of the
/// ciphertexts and is an accepted trade-off.
pub trait Cipher: Send + Sync + fmt::Debug {
    /// Encrypt plaintext
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt ciphertext
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Encrypt a batch of plaintexts in one envelope where supported
    fn seal_batch(&self, plaintexts: &[&[u8]]) -> Result<Vec<Vec<u8>>, CipherError> {
        plaintexts.iter().map(|p| self.seal(p)).collect()
    }
}

/// A cipher that stores plaintext unchanged.
///
/// For tests and local development only; provides no confidentiality.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}

/// Base64url-encoded ciphertext as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedData(String);

impl EncryptedData {
    /// The transport encoding of the ciphertext
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cross-field invariants a decrypted record must satisfy.
///
/// Structural invariants live in the type shapes; this hook covers what
/// the type system cannot express (hash lengths, amount arithmetic,
/// counter ranges).
pub trait Validate {
    /// Check the record's cross-field invariants
    fn validate(&self) -> Result<(), ValidationError>;
}

/// A violated record invariant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    /// New validation error
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// Seals records to [`EncryptedData`] and opens them back with strict
/// validation.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    cipher: Arc<dyn Cipher>,
}

impl RecordCodec {
    /// New codec over the given cipher
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self { cipher }
    }

    /// Codec over the passthrough cipher, for tests
    pub fn passthrough() -> Self {
        Self::new(Arc::new(PassthroughCipher))
    }

    /// Serialize and seal a record
    pub fn seal<T: Serialize>(&self, value: &T) -> Result<EncryptedData, Error> {
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = self
            .cipher
            .seal(&plaintext)
            .map_err(|e| Error::Custom(e.to_string()))?;
        Ok(EncryptedData(base64_engine().encode(ciphertext)))
    }

    /// Serialize and seal a batch of records in one envelope
    pub fn seal_batch<T: Serialize>(&self, values: &[T]) -> Result<Vec<EncryptedData>, Error> {
        let plaintexts = values
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        let borrowed: Vec<&[u8]> = plaintexts.iter().map(|p| p.as_slice()).collect();
        let ciphertexts = self
            .cipher
            .seal_batch(&borrowed)
            .map_err(|e| Error::Custom(e.to_string()))?;
        Ok(ciphertexts
            .into_iter()
            .map(|c| EncryptedData(base64_engine().encode(c)))
            .collect())
    }

    /// Open, parse and validate a record.
    ///
    /// Every failure mode is [`Error::Corruption`].
    pub fn open<T: DeserializeOwned + Validate>(&self, data: &EncryptedData) -> Result<T, Error> {
        let ciphertext = base64_engine()
            .decode(data.as_str())
            .map_err(|e| Error::Corruption(format!("transport encoding: {e}")))?;
        let plaintext = self
            .cipher
            .open(&ciphertext)
            .map_err(|e| Error::Corruption(format!("cipher: {e}")))?;
        let value: T = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Corruption(format!("schema: {e}")))?;
        value
            .validate()
            .map_err(|e| Error::Corruption(format!("invariant: {e}")))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        amount: crate::Money,
        note: Option<String>,
    }

    impl Validate for Payload {
        fn validate(&self) -> Result<(), ValidationError> {
            self.amount
                .check_unit()
                .map_err(|e| ValidationError::new(e.to_string()))
        }
    }

    /// Reversible cipher that actually transforms the bytes, proving
    /// seal and open are both exercised
    #[derive(Debug)]
    struct XorCipher(u8);

    impl Cipher for XorCipher {
        fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
            Ok(plaintext.iter().map(|b| b ^ self.0).collect())
        }

        fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
            Ok(ciphertext.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let codec = RecordCodec::new(Arc::new(XorCipher(0x5a)));
        let payload = Payload {
            amount: crate::Money::new(crate::Amount::from(21), crate::Currency::Btc),
            note: None,
        };

        let sealed = codec.seal(&payload).unwrap();
        // Ciphertext is not the plaintext
        assert!(!sealed.as_str().contains("amount"));

        let opened: Payload = codec.open(&sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn validation_failure_is_corruption() {
        let codec = RecordCodec::passthrough();
        // Unit does not match the currency
        let bad = serde_json::json!({
            "amount": {"amount": 5, "currency": "BTC", "unit": "cent"},
            "note": null,
        });
        let sealed = codec.seal(&bad).unwrap();
        let result: Result<Payload, _> = codec.open(&sealed);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn garbage_ciphertext_is_corruption() {
        let codec = RecordCodec::passthrough();
        let result: Result<Payload, _> =
            codec.open(&EncryptedData("!!not-base64url!!".to_string()));
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn batch_seal_matches_individual_open() {
        let codec = RecordCodec::new(Arc::new(XorCipher(0x33)));
        let payloads = vec![
            Payload {
                amount: crate::Money::new(crate::Amount::from(1), crate::Currency::Usd),
                note: Some("a".to_string()),
            },
            Payload {
                amount: crate::Money::new(crate::Amount::from(2), crate::Currency::Usd),
                note: None,
            },
        ];
        let sealed = codec.seal_batch(&payloads).unwrap();
        assert_eq!(sealed.len(), 2);
        for (blob, payload) in sealed.iter().zip(&payloads) {
            let opened: Payload = codec.open(blob).unwrap();
            assert_eq!(&opened, payload);
        }
    }
}
