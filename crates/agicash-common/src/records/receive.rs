//! Receive quote records

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::require_hex;
use crate::amount::{Amount, Money};
use crate::codec::{Validate, ValidationError};
use crate::error::Error;
use crate::keyset::Id;
use crate::mint_url::MintUrl;
use crate::proof::Proofs;
use crate::util::unix_time;

/// Deterministic output allocation recorded when a quote is paid, so a
/// crashed completion can replay or restore the exact same outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintedOutputs {
    /// Keyset the outputs are bound to
    pub keyset_id: Id,
    /// First counter value of the reserved range
    pub keyset_counter: u32,
    /// Output denominations, in counter order
    pub output_amounts: Vec<Amount>,
}

impl MintedOutputs {
    /// Number of counter values the allocation spans
    pub fn count(&self) -> u32 {
        self.output_amounts.len() as u32
    }
}

/// Data carried by a cross-mint receive: the source-mint proofs that
/// will be melted to pay the destination quote's invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenReceiveData {
    /// Mint the incoming token's proofs belong to
    pub source_mint_url: MintUrl,
    /// Proofs from the incoming token
    pub token_proofs: Proofs,
    /// Melt quote on the source mint; also the melt idempotency key
    pub melt_quote_id: String,
    /// Expiry of the melt quote, unix seconds
    pub melt_quote_expiry: u64,
    /// Latch: the melt has been initiated at least once
    pub melt_initiated: bool,
    /// Fee for the receive-side mint
    pub cashu_receive_fee: Amount,
    /// Lightning fee reserve of the melt quote
    pub lightning_fee_reserve: Amount,
}

/// How a receive is funded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "token_receive_data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiveKind {
    /// Paid by an external Lightning sender
    Lightning,
    /// Paid by melting an incoming token from another mint
    CashuToken(TokenReceiveData),
}

impl ReceiveKind {
    /// Token receive data, if this is a cross-mint receive
    pub fn token_receive_data(&self) -> Option<&TokenReceiveData> {
        match self {
            ReceiveKind::Lightning => None,
            ReceiveKind::CashuToken(data) => Some(data),
        }
    }
}

/// State of a cashu receive quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashuReceiveQuoteState {
    /// Waiting for the invoice to be paid
    Unpaid,
    /// Invoice paid; outputs allocated, proofs not inserted yet
    Paid(MintedOutputs),
    /// Proofs minted and inserted
    Completed(MintedOutputs),
    /// Expired before payment
    Expired,
    /// Failed
    Failed {
        /// Why the receive failed
        reason: String,
    },
}

/// A mint-quote lifecycle record on a cashu account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashuReceiveQuote {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Receiving account
    pub account_id: Uuid,
    /// User-visible transaction this record projects into
    pub transaction_id: Uuid,
    /// Mint-side quote id
    pub quote_id: String,
    /// Amount to be minted
    pub amount: Money,
    /// Invoice description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// bolt11 payment request of the quote
    pub payment_request: String,
    /// Payment hash of the invoice, hex
    pub payment_hash: String,
    /// Derivation path of the key the quote is locked to
    pub locking_derivation_path: String,
    /// Leaf index of the locking key
    pub locking_index: u32,
    /// Fee charged by the mint for minting, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minting_fee: Option<Amount>,
    /// Total fee of the receive
    pub total_fee: Amount,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Expiry, unix seconds
    pub expires_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// How the receive is funded
    #[serde(flatten)]
    pub kind: ReceiveKind,
    /// Lifecycle state
    #[serde(flatten)]
    pub state: CashuReceiveQuoteState,
}

impl CashuReceiveQuote {
    /// New quote record in UNPAID.
    ///
    /// For a cross-mint receive, `expires_at` must already be the min
    /// of the mint-quote and melt-quote expiries; the total fee follows
    /// the kind: `minting_fee` alone for Lightning,
    /// `minting_fee + cashu_receive_fee + lightning_fee_reserve` for a
    /// token receive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        account_id: Uuid,
        quote_id: String,
        amount: Money,
        description: Option<String>,
        payment_request: String,
        payment_hash: String,
        locking_derivation_path: String,
        locking_index: u32,
        minting_fee: Option<Amount>,
        expires_at: u64,
        kind: ReceiveKind,
    ) -> Self {
        let minting = minting_fee.unwrap_or_default();
        let total_fee = match &kind {
            ReceiveKind::Lightning => minting,
            ReceiveKind::CashuToken(data) => {
                minting + data.cashu_receive_fee + data.lightning_fee_reserve
            }
        };

        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            transaction_id: Uuid::new_v4(),
            quote_id,
            amount,
            description,
            payment_request,
            payment_hash,
            locking_derivation_path,
            locking_index,
            minting_fee,
            total_fee,
            created_at: unix_time(),
            expires_at,
            version: 0,
            kind,
            state: CashuReceiveQuoteState::Unpaid,
        }
    }

    /// Clear state tag for indexing
    pub fn state_tag(&self) -> &'static str {
        match &self.state {
            CashuReceiveQuoteState::Unpaid => "UNPAID",
            CashuReceiveQuoteState::Paid(_) => "PAID",
            CashuReceiveQuoteState::Completed(_) => "COMPLETED",
            CashuReceiveQuoteState::Expired => "EXPIRED",
            CashuReceiveQuoteState::Failed { .. } => "FAILED",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CashuReceiveQuoteState::Completed(_)
                | CashuReceiveQuoteState::Expired
                | CashuReceiveQuoteState::Failed { .. }
        )
    }

    /// Whether the clock is past the quote expiry
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    fn transition_error(&self, attempted: &str) -> Error {
        Error::InvalidStateTransition {
            record: "cashu receive quote",
            detail: format!("{attempted} from {}", self.state_tag()),
        }
    }

    /// UNPAID → PAID, recording the output allocation
    pub fn process_payment(&mut self, outputs: MintedOutputs) -> Result<(), Error> {
        match self.state {
            CashuReceiveQuoteState::Unpaid => {
                self.state = CashuReceiveQuoteState::Paid(outputs);
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("process_payment")),
        }
    }

    /// PAID → COMPLETED, once the minted proofs are inserted
    pub fn complete(&mut self) -> Result<(), Error> {
        match &self.state {
            CashuReceiveQuoteState::Paid(outputs) => {
                self.state = CashuReceiveQuoteState::Completed(outputs.clone());
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("complete")),
        }
    }

    /// UNPAID → EXPIRED
    pub fn expire(&mut self) -> Result<(), Error> {
        match self.state {
            CashuReceiveQuoteState::Unpaid => {
                self.state = CashuReceiveQuoteState::Expired;
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("expire")),
        }
    }

    /// UNPAID or PAID → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        match self.state {
            CashuReceiveQuoteState::Unpaid | CashuReceiveQuoteState::Paid(_) => {
                self.state = CashuReceiveQuoteState::Failed {
                    reason: reason.into(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }

    /// Set the melt latch of a cross-mint receive.
    ///
    /// Returns whether the latch flipped; re-setting an already set
    /// latch is a no-op and does not bump the version.
    pub fn mark_melt_initiated(&mut self) -> Result<bool, Error> {
        match &mut self.kind {
            ReceiveKind::CashuToken(data) => {
                if data.melt_initiated {
                    return Ok(false);
                }
                data.melt_initiated = true;
                self.version += 1;
                Ok(true)
            }
            ReceiveKind::Lightning => Err(Error::InvalidStateTransition {
                record: "cashu receive quote",
                detail: "mark_melt_initiated on a LIGHTNING receive".to_string(),
            }),
        }
    }

    /// Output allocation, when the quote is PAID or COMPLETED
    pub fn minted_outputs(&self) -> Option<&MintedOutputs> {
        match &self.state {
            CashuReceiveQuoteState::Paid(outputs)
            | CashuReceiveQuoteState::Completed(outputs) => Some(outputs),
            _ => None,
        }
    }
}

impl Validate for CashuReceiveQuote {
    fn validate(&self) -> Result<(), ValidationError> {
        require_hex(&self.payment_hash, 64, "payment_hash")?;
        self.amount
            .check_unit()
            .map_err(|e| ValidationError::new(e.to_string()))?;
        if self.quote_id.is_empty() {
            return Err(ValidationError::new("quote_id is empty"));
        }
        if let Some(outputs) = self.minted_outputs() {
            if outputs.output_amounts.is_empty() {
                return Err(ValidationError::new("minted outputs are empty"));
            }
            let total: Amount = outputs.output_amounts.iter().copied().sum();
            if total != self.amount.amount {
                return Err(ValidationError::new(format!(
                    "output amounts sum to {total}, quote is for {}",
                    self.amount.amount
                )));
            }
        }
        if let ReceiveKind::CashuToken(data) = &self.kind {
            if data.melt_quote_id.is_empty() {
                return Err(ValidationError::new("melt_quote_id is empty"));
            }
            if data.token_proofs.is_empty() {
                return Err(ValidationError::new("token_proofs are empty"));
            }
        }
        if let CashuReceiveQuoteState::Failed { reason } = &self.state {
            if reason.is_empty() {
                return Err(ValidationError::new("failure reason is empty"));
            }
        }
        Ok(())
    }
}

/// State of a spark receive quote.
///
/// Spark reports TRANSFER_COMPLETED with the preimage in one step, so
/// there is no PAID intermediate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SparkReceiveQuoteState {
    /// Waiting for the invoice to be paid
    Unpaid,
    /// Transfer completed and credited
    Completed {
        /// Preimage of the settled payment
        payment_preimage: String,
        /// Spark-side transfer id
        spark_transfer_id: String,
    },
    /// Expired before payment
    Expired,
    /// Failed
    Failed {
        /// Why the receive failed
        reason: String,
    },
}

/// A Lightning receive-request lifecycle record on a spark account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkReceiveQuote {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Receiving account
    pub account_id: Uuid,
    /// User-visible transaction this record projects into
    pub transaction_id: Uuid,
    /// Spark-side receive-request id
    pub spark_id: String,
    /// Amount to receive
    pub amount: Money,
    /// Invoice description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// bolt11 payment request
    pub payment_request: String,
    /// Payment hash of the invoice, hex
    pub payment_hash: String,
    /// Identity pubkey of the receiver, when locked to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_identity_pubkey: Option<crate::proof::PublicKey>,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Expiry, unix seconds
    pub expires_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// How the receive is funded
    #[serde(flatten)]
    pub kind: ReceiveKind,
    /// Lifecycle state
    #[serde(flatten)]
    pub state: SparkReceiveQuoteState,
}

impl SparkReceiveQuote {
    /// Clear state tag for indexing
    pub fn state_tag(&self) -> &'static str {
        match &self.state {
            SparkReceiveQuoteState::Unpaid => "UNPAID",
            SparkReceiveQuoteState::Completed { .. } => "COMPLETED",
            SparkReceiveQuoteState::Expired => "EXPIRED",
            SparkReceiveQuoteState::Failed { .. } => "FAILED",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, SparkReceiveQuoteState::Unpaid)
    }

    /// Whether the clock is past the quote expiry
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    fn transition_error(&self, attempted: &str) -> Error {
        Error::InvalidStateTransition {
            record: "spark receive quote",
            detail: format!("{attempted} from {}", self.state_tag()),
        }
    }

    /// UNPAID → COMPLETED with the transfer outcome
    pub fn complete(
        &mut self,
        payment_preimage: String,
        spark_transfer_id: String,
    ) -> Result<(), Error> {
        match self.state {
            SparkReceiveQuoteState::Unpaid => {
                self.state = SparkReceiveQuoteState::Completed {
                    payment_preimage,
                    spark_transfer_id,
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("complete")),
        }
    }

    /// UNPAID → EXPIRED
    pub fn expire(&mut self) -> Result<(), Error> {
        match self.state {
            SparkReceiveQuoteState::Unpaid => {
                self.state = SparkReceiveQuoteState::Expired;
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("expire")),
        }
    }

    /// UNPAID → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        match self.state {
            SparkReceiveQuoteState::Unpaid => {
                self.state = SparkReceiveQuoteState::Failed {
                    reason: reason.into(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }

    /// Latch used by the cross-mint bridge; mirrors the cashu variant
    pub fn mark_melt_initiated(&mut self) -> Result<bool, Error> {
        match &mut self.kind {
            ReceiveKind::CashuToken(data) => {
                if data.melt_initiated {
                    return Ok(false);
                }
                data.melt_initiated = true;
                self.version += 1;
                Ok(true)
            }
            ReceiveKind::Lightning => Err(Error::InvalidStateTransition {
                record: "spark receive quote",
                detail: "mark_melt_initiated on a LIGHTNING receive".to_string(),
            }),
        }
    }
}

impl Validate for SparkReceiveQuote {
    fn validate(&self) -> Result<(), ValidationError> {
        require_hex(&self.payment_hash, 64, "payment_hash")?;
        self.amount
            .check_unit()
            .map_err(|e| ValidationError::new(e.to_string()))?;
        if self.spark_id.is_empty() {
            return Err(ValidationError::new("spark_id is empty"));
        }
        if let SparkReceiveQuoteState::Completed {
            payment_preimage, ..
        } = &self.state
        {
            require_hex(payment_preimage, 64, "payment_preimage")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::amount::Currency;

    fn outputs() -> MintedOutputs {
        MintedOutputs {
            keyset_id: Id::from_str("00deadbeef123456").unwrap(),
            keyset_counter: 0,
            output_amounts: vec![Amount::from(512), Amount::from(256), Amount::from(232)],
        }
    }

    fn quote() -> CashuReceiveQuote {
        CashuReceiveQuote::new(
            "user-1",
            Uuid::new_v4(),
            "quote-1".to_string(),
            Money::new(Amount::from(1000), Currency::Btc),
            None,
            "lnbc10u1p...".to_string(),
            "aa".repeat(32),
            "129372'/0'/0'/0".to_string(),
            0,
            None,
            unix_time() + 600,
            ReceiveKind::Lightning,
        )
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut quote = quote();
        assert_eq!(quote.version, 0);
        assert_eq!(quote.state_tag(), "UNPAID");

        quote.process_payment(outputs()).unwrap();
        assert_eq!(quote.state_tag(), "PAID");
        assert_eq!(quote.version, 1);

        quote.complete().unwrap();
        assert_eq!(quote.state_tag(), "COMPLETED");
        assert_eq!(quote.version, 2);
        assert!(quote.is_terminal());

        // Terminal states admit no further transitions
        assert!(quote.complete().is_err());
        assert!(quote.fail("late").is_err());
    }

    #[test]
    fn expire_only_from_unpaid() {
        let mut quote = quote();
        quote.process_payment(outputs()).unwrap();
        assert!(quote.expire().is_err());
    }

    #[test]
    fn paid_can_fail_unrecoverably() {
        let mut quote = quote();
        quote.process_payment(outputs()).unwrap();
        quote.fail("mint rejected outputs").unwrap();
        assert_eq!(quote.state_tag(), "FAILED");
    }

    #[test]
    fn melt_latch_is_idempotent() {
        let mut quote = quote();
        assert!(quote.mark_melt_initiated().is_err());

        let data = TokenReceiveData {
            source_mint_url: "https://other-mint.example.com".parse().unwrap(),
            token_proofs: vec![crate::proof::Proof {
                amount: Amount::from(1000),
                keyset_id: Id::from_str("00aaaaaaaaaaaaaa").unwrap(),
                secret: crate::secret::Secret::generate(),
                c: crate::proof::SecretKey::from_slice(&[2u8; 32])
                    .unwrap()
                    .public_key(&crate::SECP256K1),
            }],
            melt_quote_id: "melt-1".to_string(),
            melt_quote_expiry: unix_time() + 300,
            melt_initiated: false,
            cashu_receive_fee: Amount::from(1),
            lightning_fee_reserve: Amount::from(2),
        };
        quote.kind = ReceiveKind::CashuToken(data);
        let version = quote.version;

        assert!(quote.mark_melt_initiated().unwrap());
        assert_eq!(quote.version, version + 1);
        // Second call is a no-op
        assert!(!quote.mark_melt_initiated().unwrap());
        assert_eq!(quote.version, version + 1);
    }

    #[test]
    fn token_receive_total_fee_convention() {
        let data = TokenReceiveData {
            source_mint_url: "https://other-mint.example.com".parse().unwrap(),
            token_proofs: vec![],
            melt_quote_id: "melt-1".to_string(),
            melt_quote_expiry: 0,
            melt_initiated: false,
            cashu_receive_fee: Amount::from(3),
            lightning_fee_reserve: Amount::from(5),
        };
        let quote = CashuReceiveQuote::new(
            "user-1",
            Uuid::new_v4(),
            "quote-1".to_string(),
            Money::new(Amount::from(1000), Currency::Usd),
            None,
            "lnbc...".to_string(),
            "bb".repeat(32),
            "129372'/0'/0'/1".to_string(),
            1,
            Some(Amount::from(2)),
            0,
            ReceiveKind::CashuToken(data),
        );
        assert_eq!(quote.total_fee, Amount::from(10));
    }

    #[test]
    fn serde_layout_matches_union_invariants() {
        let quote = quote();
        let json = serde_json::to_value(&quote).unwrap();
        assert_eq!(json["state"], "UNPAID");
        assert_eq!(json["type"], "LIGHTNING");
        assert!(json.get("token_receive_data").is_none());

        let mut paid = quote;
        paid.process_payment(outputs()).unwrap();
        let json = serde_json::to_value(&paid).unwrap();
        assert_eq!(json["state"], "PAID");
        assert!(json.get("output_amounts").is_some());

        let back: CashuReceiveQuote = serde_json::from_value(json).unwrap();
        assert_eq!(back, paid);
    }

    #[test]
    fn validate_rejects_mismatched_outputs() {
        let mut quote = quote();
        let mut bad = outputs();
        bad.output_amounts = vec![Amount::from(1)];
        quote.process_payment(bad).unwrap();
        assert!(quote.validate().is_err());
    }
}
