//! Send quote records

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::require_hex;
use crate::amount::{Amount, Money};
use crate::codec::{Validate, ValidationError};
use crate::error::Error;
use crate::keyset::Id;
use crate::proof::PublicKey;
use crate::util::unix_time;

/// State of a cashu send quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashuSendQuoteState {
    /// Created; inputs reserved, melt not initiated
    Unpaid,
    /// Melt initiated at the mint; change output plan committed
    Pending {
        /// Keyset the change outputs are bound to
        keyset_id: Id,
        /// First counter value of the change range
        keyset_counter: u32,
        /// Change denominations requested from the fee reserve
        change_output_amounts: Vec<Amount>,
    },
    /// Payment settled; inputs consumed, change inserted
    Completed {
        /// Actual Lightning fee paid
        fee: Amount,
        /// Preimage of the settled payment, when the mint returns one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payment_preimage: Option<String>,
        /// Change credited back from the fee reserve
        change_amount: Amount,
    },
    /// Expired before the melt was initiated
    Expired,
    /// Failed.
    ///
    /// When failure happens after PENDING with an ambiguous external
    /// outcome, the reserved inputs stay PENDING_SPEND until resolved
    /// by an operator.
    Failed {
        /// Why the send failed
        reason: String,
    },
}

/// A melt-quote lifecycle record on a cashu account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashuSendQuote {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Spending account
    pub account_id: Uuid,
    /// User-visible transaction this record projects into
    pub transaction_id: Uuid,
    /// Mint-side melt quote id; also the melt idempotency key
    pub quote_id: String,
    /// bolt11 invoice being paid
    pub payment_request: String,
    /// Payment hash of the invoice, hex
    pub payment_hash: String,
    /// Invoice amount
    pub amount: Money,
    /// Lightning fee reserve quoted by the mint
    pub fee_reserve: Amount,
    /// Estimated total fee at creation (fee reserve + input proof fee)
    pub estimated_fee: Amount,
    /// Y values of the reserved input proofs
    pub input_proof_ys: Vec<PublicKey>,
    /// Total value of the reserved inputs
    pub input_amount: Amount,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Expiry of the melt quote, unix seconds
    pub expires_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// Lifecycle state
    #[serde(flatten)]
    pub state: CashuSendQuoteState,
}

impl CashuSendQuote {
    /// New send quote in UNPAID with inputs reserved
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        account_id: Uuid,
        quote_id: String,
        payment_request: String,
        payment_hash: String,
        amount: Money,
        fee_reserve: Amount,
        estimated_fee: Amount,
        input_proof_ys: Vec<PublicKey>,
        input_amount: Amount,
        expires_at: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            transaction_id: Uuid::new_v4(),
            quote_id,
            payment_request,
            payment_hash,
            amount,
            fee_reserve,
            estimated_fee,
            input_proof_ys,
            input_amount,
            created_at: unix_time(),
            expires_at,
            version: 0,
            state: CashuSendQuoteState::Unpaid,
        }
    }

    /// Clear state tag for indexing
    pub fn state_tag(&self) -> &'static str {
        match &self.state {
            CashuSendQuoteState::Unpaid => "UNPAID",
            CashuSendQuoteState::Pending { .. } => "PENDING",
            CashuSendQuoteState::Completed { .. } => "COMPLETED",
            CashuSendQuoteState::Expired => "EXPIRED",
            CashuSendQuoteState::Failed { .. } => "FAILED",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CashuSendQuoteState::Completed { .. }
                | CashuSendQuoteState::Expired
                | CashuSendQuoteState::Failed { .. }
        )
    }

    /// Whether the clock is past the quote expiry
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Whether inputs must be released when this transition lands.
    ///
    /// Only an UNPAID failure or expiry releases; a failure after
    /// PENDING parks the inputs for operator resolution.
    pub fn releases_inputs_on_abort(&self) -> bool {
        matches!(self.state, CashuSendQuoteState::Unpaid)
    }

    fn transition_error(&self, attempted: &str) -> Error {
        Error::InvalidStateTransition {
            record: "cashu send quote",
            detail: format!("{attempted} from {}", self.state_tag()),
        }
    }

    /// UNPAID → PENDING, committing the change output plan
    pub fn mark_as_pending(
        &mut self,
        keyset_id: Id,
        keyset_counter: u32,
        change_output_amounts: Vec<Amount>,
    ) -> Result<(), Error> {
        match self.state {
            CashuSendQuoteState::Unpaid => {
                self.state = CashuSendQuoteState::Pending {
                    keyset_id,
                    keyset_counter,
                    change_output_amounts,
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("mark_as_pending")),
        }
    }

    /// PENDING → COMPLETED with the settlement outcome
    pub fn complete(
        &mut self,
        fee: Amount,
        payment_preimage: Option<String>,
        change_amount: Amount,
    ) -> Result<(), Error> {
        match self.state {
            CashuSendQuoteState::Pending { .. } => {
                self.state = CashuSendQuoteState::Completed {
                    fee,
                    payment_preimage,
                    change_amount,
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("complete")),
        }
    }

    /// UNPAID → EXPIRED; inputs release
    pub fn expire(&mut self) -> Result<(), Error> {
        match self.state {
            CashuSendQuoteState::Unpaid => {
                self.state = CashuSendQuoteState::Expired;
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("expire")),
        }
    }

    /// UNPAID or PENDING → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        match self.state {
            CashuSendQuoteState::Unpaid | CashuSendQuoteState::Pending { .. } => {
                self.state = CashuSendQuoteState::Failed {
                    reason: reason.into(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }
}

impl Validate for CashuSendQuote {
    fn validate(&self) -> Result<(), ValidationError> {
        require_hex(&self.payment_hash, 64, "payment_hash")?;
        self.amount
            .check_unit()
            .map_err(|e| ValidationError::new(e.to_string()))?;
        if self.quote_id.is_empty() {
            return Err(ValidationError::new("quote_id is empty"));
        }
        if self.input_proof_ys.is_empty() {
            return Err(ValidationError::new("no input proofs reserved"));
        }
        if self.input_amount < self.amount.amount {
            return Err(ValidationError::new(
                "inputs do not cover the invoice amount",
            ));
        }
        if let CashuSendQuoteState::Completed {
            payment_preimage: Some(preimage),
            ..
        } = &self.state
        {
            require_hex(preimage, 64, "payment_preimage")?;
        }
        if let CashuSendQuoteState::Failed { reason } = &self.state {
            if reason.is_empty() {
                return Err(ValidationError::new("failure reason is empty"));
            }
        }
        Ok(())
    }
}

/// State of a spark send quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SparkSendQuoteState {
    /// Created; payment not initiated
    Unpaid,
    /// Payment initiated through Spark
    Pending {
        /// Spark-side payment id
        spark_id: String,
    },
    /// Payment settled
    Completed {
        /// Actual fee paid
        fee: Amount,
        /// Preimage of the settled payment
        payment_preimage: String,
    },
    /// Expired before the payment was initiated
    Expired,
    /// Failed
    Failed {
        /// Why the send failed
        reason: String,
    },
}

/// An outbound Lightning payment record on a spark account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkSendQuote {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Spending account
    pub account_id: Uuid,
    /// User-visible transaction this record projects into
    pub transaction_id: Uuid,
    /// bolt11 invoice being paid
    pub payment_request: String,
    /// Payment hash of the invoice, hex
    pub payment_hash: String,
    /// Invoice amount
    pub amount: Money,
    /// Estimated fee at creation
    pub estimated_fee: Amount,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Expiry of the invoice, unix seconds
    pub expires_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// Lifecycle state
    #[serde(flatten)]
    pub state: SparkSendQuoteState,
}

impl SparkSendQuote {
    /// New spark send quote in UNPAID
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        account_id: Uuid,
        payment_request: String,
        payment_hash: String,
        amount: Money,
        estimated_fee: Amount,
        expires_at: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            transaction_id: Uuid::new_v4(),
            payment_request,
            payment_hash,
            amount,
            estimated_fee,
            created_at: unix_time(),
            expires_at,
            version: 0,
            state: SparkSendQuoteState::Unpaid,
        }
    }

    /// Clear state tag for indexing
    pub fn state_tag(&self) -> &'static str {
        match &self.state {
            SparkSendQuoteState::Unpaid => "UNPAID",
            SparkSendQuoteState::Pending { .. } => "PENDING",
            SparkSendQuoteState::Completed { .. } => "COMPLETED",
            SparkSendQuoteState::Expired => "EXPIRED",
            SparkSendQuoteState::Failed { .. } => "FAILED",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SparkSendQuoteState::Completed { .. }
                | SparkSendQuoteState::Expired
                | SparkSendQuoteState::Failed { .. }
        )
    }

    /// Whether the clock is past the quote expiry
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    fn transition_error(&self, attempted: &str) -> Error {
        Error::InvalidStateTransition {
            record: "spark send quote",
            detail: format!("{attempted} from {}", self.state_tag()),
        }
    }

    /// UNPAID → PENDING with the external payment id
    pub fn mark_as_pending(&mut self, spark_id: String) -> Result<(), Error> {
        match self.state {
            SparkSendQuoteState::Unpaid => {
                self.state = SparkSendQuoteState::Pending { spark_id };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("mark_as_pending")),
        }
    }

    /// PENDING → COMPLETED with the settlement outcome
    pub fn complete(&mut self, fee: Amount, payment_preimage: String) -> Result<(), Error> {
        match self.state {
            SparkSendQuoteState::Pending { .. } => {
                self.state = SparkSendQuoteState::Completed {
                    fee,
                    payment_preimage,
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
            SparkSendQuoteState::Unpaid => {
                self.state = SparkSendQuoteState::Expired;
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("expire")),
        }
    }

    /// UNPAID or PENDING → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        match self.state {
            SparkSendQuoteState::Unpaid | SparkSendQuoteState::Pending { .. } => {
                self.state = SparkSendQuoteState::Failed {
                    reason: reason.into(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }
}

impl Validate for SparkSendQuote {
    fn validate(&self) -> Result<(), ValidationError> {
        require_hex(&self.payment_hash, 64, "payment_hash")?;
        self.amount
            .check_unit()
            .map_err(|e| ValidationError::new(e.to_string()))?;
        if let SparkSendQuoteState::Completed {
            payment_preimage, ..
        } = &self.state
        {
            require_hex(payment_preimage, 64, "payment_preimage")?;
        }
        if let SparkSendQuoteState::Failed { reason } = &self.state {
            if reason.is_empty() {
                return Err(ValidationError::new("failure reason is empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::amount::Currency;
    use crate::SECP256K1;

    fn send_quote() -> CashuSendQuote {
        let y = crate::proof::SecretKey::from_slice(&[4u8; 32])
            .unwrap()
            .public_key(&SECP256K1);
        CashuSendQuote::new(
            "user-1",
            Uuid::new_v4(),
            "melt-1".to_string(),
            "lnbc700n1p...".to_string(),
            "cc".repeat(32),
            Money::new(Amount::from(70), Currency::Btc),
            Amount::from(2),
            Amount::from(3),
            vec![y],
            Amount::from(73),
            unix_time() + 600,
        )
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut quote = send_quote();
        quote
            .mark_as_pending(
                Id::from_str("00deadbeef123456").unwrap(),
                5,
                vec![Amount::from(2), Amount::from(1)],
            )
            .unwrap();
        assert_eq!(quote.state_tag(), "PENDING");
        assert!(!quote.releases_inputs_on_abort());

        quote
            .complete(Amount::from(1), Some("dd".repeat(32)), Amount::from(1))
            .unwrap();
        assert_eq!(quote.state_tag(), "COMPLETED");
        assert_eq!(quote.version, 2);
    }

    #[test]
    fn unpaid_abort_releases_inputs() {
        let quote = send_quote();
        assert!(quote.releases_inputs_on_abort());

        let mut expired = send_quote();
        expired.expire().unwrap();
        assert_eq!(expired.state_tag(), "EXPIRED");

        // Cannot complete without going through PENDING
        let mut quote = send_quote();
        assert!(quote.complete(Amount::ZERO, None, Amount::ZERO).is_err());
    }

    #[test]
    fn pending_failure_parks_inputs() {
        let mut quote = send_quote();
        quote
            .mark_as_pending(Id::from_str("00deadbeef123456").unwrap(), 0, vec![])
            .unwrap();
        assert!(!quote.releases_inputs_on_abort());
        quote.fail("mint cannot report outcome").unwrap();
        assert_eq!(quote.state_tag(), "FAILED");
    }

    #[test]
    fn validate_requires_input_cover() {
        let mut quote = send_quote();
        quote.input_amount = Amount::from(10);
        assert!(quote.validate().is_err());
    }
}
