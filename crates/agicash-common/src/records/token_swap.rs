//! Token swap records (same-mint receive)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::require_hex;
use crate::amount::Amount;
use crate::codec::{Validate, ValidationError};
use crate::error::Error;
use crate::keyset::Id;
use crate::proof::Proofs;
use crate::util::unix_time;

/// State of a token swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashuTokenSwapState {
    /// Created; swap with the mint not completed yet
    Pending,
    /// Swapped proofs inserted
    Completed,
    /// Failed
    Failed {
        /// Why the swap failed
        reason: String,
    },
}

/// Swap of an incoming token's proofs into locally-owned proofs.
///
/// The token hash keys the swap; a uniqueness constraint on it makes
/// claiming the same token twice impossible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashuTokenSwap {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Receiving account
    pub account_id: Uuid,
    /// User-visible transaction this record projects into
    pub transaction_id: Uuid,
    /// sha256 of the encoded token, hex
    pub token_hash: String,
    /// Proofs presented by the incoming token
    pub token_proofs: Proofs,
    /// Value of the incoming proofs
    pub input_amount: Amount,
    /// Value credited after the swap fee
    pub amount_received: Amount,
    /// Swap fee paid to the mint
    pub fee_amount: Amount,
    /// Keyset the new outputs are bound to
    pub keyset_id: Id,
    /// First counter value of the reserved range
    pub keyset_counter: u32,
    /// Output denominations, in counter order
    pub output_amounts: Vec<Amount>,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// Lifecycle state
    #[serde(flatten)]
    pub state: CashuTokenSwapState,
}

impl CashuTokenSwap {
    /// New token swap in PENDING.
    ///
    /// The total fee of a same-mint swap is the receive fee alone.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        account_id: Uuid,
        token_hash: String,
        token_proofs: Proofs,
        input_amount: Amount,
        fee_amount: Amount,
        keyset_id: Id,
        keyset_counter: u32,
        output_amounts: Vec<Amount>,
    ) -> Result<Self, Error> {
        let amount_received = input_amount.checked_sub(fee_amount)?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            transaction_id: Uuid::new_v4(),
            token_hash,
            token_proofs,
            input_amount,
            amount_received,
            fee_amount,
            keyset_id,
            keyset_counter,
            output_amounts,
            created_at: unix_time(),
            version: 0,
            state: CashuTokenSwapState::Pending,
        })
    }

    /// Clear state tag for indexing
    pub fn state_tag(&self) -> &'static str {
        match &self.state {
            CashuTokenSwapState::Pending => "PENDING",
            CashuTokenSwapState::Completed => "COMPLETED",
            CashuTokenSwapState::Failed { .. } => "FAILED",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, CashuTokenSwapState::Pending)
    }

    fn transition_error(&self, attempted: &str) -> Error {
        Error::InvalidStateTransition {
            record: "cashu token swap",
            detail: format!("{attempted} from {}", self.state_tag()),
        }
    }

    /// PENDING → COMPLETED once the new proofs are inserted
    pub fn complete(&mut self) -> Result<(), Error> {
        match self.state {
            CashuTokenSwapState::Pending => {
                self.state = CashuTokenSwapState::Completed;
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("complete")),
        }
    }

    /// PENDING → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        match self.state {
            CashuTokenSwapState::Pending => {
                self.state = CashuTokenSwapState::Failed {
                    reason: reason.into(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }
}

impl Validate for CashuTokenSwap {
    fn validate(&self) -> Result<(), ValidationError> {
        require_hex(&self.token_hash, 64, "token_hash")?;
        if self.token_proofs.is_empty() {
            return Err(ValidationError::new("token_proofs are empty"));
        }
        if self.output_amounts.is_empty() {
            return Err(ValidationError::new("output_amounts are empty"));
        }
        let output_total: Amount = self.output_amounts.iter().copied().sum();
        if output_total != self.amount_received {
            return Err(ValidationError::new(format!(
                "outputs sum to {output_total}, amount_received is {}",
                self.amount_received
            )));
        }
        if self.amount_received + self.fee_amount != self.input_amount {
            return Err(ValidationError::new(
                "amount_received + fee_amount != input_amount",
            ));
        }
        if let CashuTokenSwapState::Failed { reason } = &self.state {
            if reason.is_empty() {
                return Err(ValidationError::new("failure reason is empty"));
            }
        }
        Ok(())
    }
}
