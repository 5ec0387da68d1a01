//! Mint wire types
//!
//! Request/response shapes for the mint endpoints the engine drives.
//! The mint itself is an external collaborator; these types are the
//! contract of the connector seam.

use serde::{Deserialize, Serialize};

use crate::amount::{Amount, CurrencyUnit};
use crate::error::{MintErrorCode, MintOperationError};
use crate::keyset::{KeySet, KeySetInfo};
use crate::proof::{BlindSignature, BlindedMessage, Proofs, PublicKey};

/// Keys of one or more keysets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysResponse {
    /// Keysets with their full key material
    pub keysets: Vec<KeySet>,
}

/// Keyset metadata listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetResponse {
    /// Advertised keysets
    pub keysets: Vec<KeySetInfo>,
}

/// Mint metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintInfo {
    /// Mint name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Mint software version string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Long description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// State of a mint quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MintQuoteState {
    /// Invoice not paid yet
    Unpaid,
    /// Invoice paid, proofs not issued yet
    Paid,
    /// Proofs issued for the quote
    Issued,
}

/// Request a mint quote, optionally locked to a public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuoteRequest {
    /// Amount to mint
    pub amount: Amount,
    /// Unit to mint in
    pub unit: CurrencyUnit,
    /// Invoice description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Key the quote is locked to; the mint request must be signed by it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<PublicKey>,
}

/// Mint quote as returned and re-checked via the mint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuoteResponse {
    /// Quote id
    pub quote: String,
    /// bolt11 payment request
    pub request: String,
    /// Quote state
    pub state: MintQuoteState,
    /// Unix expiry of the quote
    pub expiry: u64,
    /// Key the quote is locked to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<PublicKey>,
}

/// Request blind signatures for a paid quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    /// Quote id
    pub quote: String,
    /// Outputs to sign
    pub outputs: Vec<BlindedMessage>,
    /// BIP-340 signature by the quote's locking key, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Blind signatures for a mint request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintResponse {
    /// One signature per requested output, in order
    pub signatures: Vec<BlindSignature>,
}

/// Swap input proofs for new outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    /// Proofs to consume
    pub inputs: Proofs,
    /// Outputs to sign
    pub outputs: Vec<BlindedMessage>,
}

/// Blind signatures for a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapResponse {
    /// One signature per requested output, in order
    pub signatures: Vec<BlindSignature>,
}

/// State of a melt quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeltQuoteState {
    /// Lightning payment not attempted yet
    Unpaid,
    /// Payment in flight
    Pending,
    /// Payment settled
    Paid,
    /// Mint cannot determine the payment outcome
    Unknown,
    /// Payment failed
    Failed,
}

/// Request a melt quote for a bolt11 invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltQuoteRequest {
    /// bolt11 invoice to pay
    pub request: String,
    /// Unit the inputs will be in
    pub unit: CurrencyUnit,
}

/// Melt quote as returned and re-checked via the mint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltQuoteResponse {
    /// Quote id, also the idempotency key for the melt call
    pub quote: String,
    /// Amount that must be provided as inputs, excluding fee reserve
    pub amount: Amount,
    /// Reserve for the Lightning fee; overpayment returns as change
    pub fee_reserve: Amount,
    /// Quote state
    pub state: MeltQuoteState,
    /// Unix expiry of the quote
    pub expiry: u64,
    /// Preimage of the settled payment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_preimage: Option<String>,
    /// Change for the unused part of the fee reserve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Vec<BlindSignature>>,
}

/// Melt proofs to pay the quoted invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltRequest {
    /// Quote id
    pub quote: String,
    /// Proofs to burn
    pub inputs: Proofs,
    /// Blank outputs for fee-reserve change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<BlindedMessage>>,
}

/// Proof state as the mint reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckedProofState {
    /// Not spent
    Unspent,
    /// In flight in some transaction
    Pending,
    /// Spent
    Spent,
}

/// Ask the mint for the state of proofs by their Y values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStateRequest {
    /// Y values to check
    #[serde(rename = "Ys")]
    pub ys: Vec<PublicKey>,
}

/// Per-proof state answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStateInfo {
    /// Y the state is for
    #[serde(rename = "Y")]
    pub y: PublicKey,
    /// State at the mint
    pub state: CheckedProofState,
}

/// Response to [`CheckStateRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStateResponse {
    /// One entry per requested Y, in order
    pub states: Vec<ProofStateInfo>,
}

/// Ask the mint to re-issue signatures for already-signed outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Blinded messages to restore
    pub outputs: Vec<BlindedMessage>,
}

/// Signatures for the subset of outputs the mint had signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResponse {
    /// Outputs the mint recognized, in request order
    pub outputs: Vec<BlindedMessage>,
    /// Signature for each recognized output
    pub signatures: Vec<BlindSignature>,
}

/// Error body a mint answers with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric protocol code, if the mint sends one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Human-readable detail
    #[serde(default)]
    pub detail: String,
}

impl From<ErrorResponse> for MintOperationError {
    fn from(response: ErrorResponse) -> Self {
        let code = response.code.and_then(|code| match code {
            10002 => Some(MintErrorCode::OutputAlreadySigned),
            11001 => Some(MintErrorCode::TokenAlreadySpent),
            11002 => Some(MintErrorCode::TransactionUnbalanced),
            20001 => Some(MintErrorCode::QuoteNotPaid),
            20002 => Some(MintErrorCode::QuoteAlreadyIssued),
            20007 => Some(MintErrorCode::QuoteExpired),
            _ => None,
        });
        MintOperationError::new(code, response.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_code_mapping() {
        let err: MintOperationError = ErrorResponse {
            code: Some(10002),
            detail: "outputs have already been signed before".to_string(),
        }
        .into();
        assert_eq!(err.code, MintErrorCode::OutputAlreadySigned);

        // Unknown numeric code falls back to the detail string
        let err: MintOperationError = ErrorResponse {
            code: Some(31337),
            detail: "Token already spent".to_string(),
        }
        .into();
        assert_eq!(err.code, MintErrorCode::TokenAlreadySpent);
    }

    #[test]
    fn quote_state_wire_tags() {
        assert_eq!(
            serde_json::to_string(&MintQuoteState::Unpaid).unwrap(),
            r#""UNPAID""#
        );
        assert_eq!(
            serde_json::to_string(&MeltQuoteState::Pending).unwrap(),
            r#""PENDING""#
        );
    }
}
