//! Errors

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::{self, Currency};

/// Agicash error
#[derive(Debug, Error)]
pub enum Error {
    /// Optimistic-lock version mismatch; retryable after a re-read
    #[error("Version conflict on `{record}` `{id}`")]
    Concurrency {
        /// Record class the conflict occurred on
        record: &'static str,
        /// Record id
        id: String,
    },
    /// A proof with the same public key Y already exists
    #[error("Proof with y `{0}` already in store")]
    DuplicateProof(String),
    /// A token swap for the same token hash already exists
    #[error("Token already claimed")]
    TokenAlreadyClaimed,
    /// A send record for the same payment hash already exists
    #[error("Payment hash `{0}` already used")]
    DuplicatePaymentHash(String),
    /// Mint rejected or qualified an operation with a protocol code
    #[error("Mint operation failed: {0}")]
    MintOperation(MintOperationError),
    /// Operation exceeded its time budget
    #[error("Operation timeout")]
    Timeout,
    /// Account balance cannot cover the requested amount
    #[error("Insufficient balance")]
    InsufficientBalance,
    /// Persisted blob failed to decrypt or validate; never healed
    #[error("Corrupt record: {0}")]
    Corruption(String),
    /// Record is not in a state the transition is legal from
    #[error("Invalid transition for `{record}`: {detail}")]
    InvalidStateTransition {
        /// Record class
        record: &'static str,
        /// What was attempted from which state
        detail: String,
    },
    /// Referenced record does not exist
    #[error("Unknown {0} `{1}`")]
    NotFound(&'static str, String),
    /// Quote is past its expiry
    #[error("Quote expired")]
    QuoteExpired,
    /// Account is not of the kind the operation requires
    #[error("Operation requires a {0} account")]
    WrongAccountKind(&'static str),
    /// Account currency does not match the operation currency
    #[error("Account is denominated in `{0}`, got `{1}`")]
    CurrencyMismatch(Currency, Currency),
    /// Keyset is not known
    #[error("Keyset id not known: `{0}`")]
    KeysetUnknown(String),
    /// No active keyset for the unit
    #[error("No active keyset")]
    NoActiveKeyset,
    /// Mint was unreachable at initialisation; operation requires connectivity
    #[error("Mint `{0}` is offline")]
    Offline(String),
    /// Amount error
    #[error(transparent)]
    Amount(#[from] amount::Error),
    /// Hex error
    #[error(transparent)]
    Hex(#[from] crate::util::hex::Error),
    /// Mint url error
    #[error(transparent)]
    MintUrl(#[from] crate::mint_url::Error),
    /// Secp256k1 error
    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    /// Bip32 derivation error
    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),
    /// JSON error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Token encoding error
    #[error(transparent)]
    Token(#[from] crate::token::Error),
    /// Network error from a connector
    #[error("Network error: {0}")]
    Network(String),
    /// Custom error
    #[error("`{0}`")]
    Custom(String),
}

impl Error {
    /// Whether the caller should re-read and retry the transition
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }
}

/// Protocol error codes a mint can answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MintErrorCode {
    /// Blinded message was already signed; recover via restore
    OutputAlreadySigned,
    /// Quote was already issued; recover via restore
    QuoteAlreadyIssued,
    /// An input proof was already spent; recover via restore
    TokenAlreadySpent,
    /// Quote is not paid yet
    QuoteNotPaid,
    /// Quote expired on the mint side
    QuoteExpired,
    /// Inputs do not cover outputs plus fee
    TransactionUnbalanced,
    /// Anything the mint reported that the wallet has no handling for
    Unknown,
}

impl MintErrorCode {
    /// Codes that are recovered by a deterministic restore over the
    /// operation's recorded counter range
    pub fn is_recoverable_by_restore(&self) -> bool {
        matches!(
            self,
            MintErrorCode::OutputAlreadySigned
                | MintErrorCode::QuoteAlreadyIssued
                | MintErrorCode::TokenAlreadySpent
        )
    }

    /// Fuzzy fallback for mints that predate structured error codes
    /// (Nutshell before 0.16.5 sends free-form detail strings).
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if lowered.contains("outputs have already been signed")
            || lowered.contains("output already signed")
        {
            MintErrorCode::OutputAlreadySigned
        } else if lowered.contains("already issued") {
            MintErrorCode::QuoteAlreadyIssued
        } else if lowered.contains("already spent") {
            MintErrorCode::TokenAlreadySpent
        } else if lowered.contains("not paid") {
            MintErrorCode::QuoteNotPaid
        } else if lowered.contains("expired") {
            MintErrorCode::QuoteExpired
        } else {
            MintErrorCode::Unknown
        }
    }
}

impl fmt::Display for MintErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MintErrorCode::OutputAlreadySigned => write!(f, "OUTPUT_ALREADY_SIGNED"),
            MintErrorCode::QuoteAlreadyIssued => write!(f, "QUOTE_ALREADY_ISSUED"),
            MintErrorCode::TokenAlreadySpent => write!(f, "TOKEN_ALREADY_SPENT"),
            MintErrorCode::QuoteNotPaid => write!(f, "QUOTE_NOT_PAID"),
            MintErrorCode::QuoteExpired => write!(f, "QUOTE_EXPIRED"),
            MintErrorCode::TransactionUnbalanced => write!(f, "TRANSACTION_UNBALANCED"),
            MintErrorCode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A mint error with its resolved code and the raw detail string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {detail}")]
pub struct MintOperationError {
    /// Resolved protocol code
    pub code: MintErrorCode,
    /// Raw detail from the mint, kept for failure reasons
    pub detail: String,
}

impl MintOperationError {
    /// Resolve a mint error response into a typed error.
    ///
    /// `code` is the numeric/symbolic code if the mint sent one; the
    /// detail string is used as a fuzzy fallback otherwise.
    pub fn new(code: Option<MintErrorCode>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let code = code.unwrap_or_else(|| MintErrorCode::from_message(&detail));
        Self { code, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzzy_code_resolution() {
        assert_eq!(
            MintErrorCode::from_message("outputs have already been signed before"),
            MintErrorCode::OutputAlreadySigned
        );
        assert_eq!(
            MintErrorCode::from_message("Token already spent."),
            MintErrorCode::TokenAlreadySpent
        );
        assert_eq!(
            MintErrorCode::from_message("something else"),
            MintErrorCode::Unknown
        );
    }

    #[test]
    fn explicit_code_wins_over_fuzzy() {
        let err = MintOperationError::new(
            Some(MintErrorCode::QuoteAlreadyIssued),
            "detail mentioning already spent",
        );
        assert_eq!(err.code, MintErrorCode::QuoteAlreadyIssued);
        assert!(err.code.is_recoverable_by_restore());
    }
}
