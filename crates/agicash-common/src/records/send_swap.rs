//! Send swap records (same-mint send)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::require_hex;
use crate::amount::Amount;
use crate::codec::{Validate, ValidationError};
use crate::error::Error;
use crate::keyset::Id;
use crate::proof::PublicKey;
use crate::util::unix_time;

/// The two deterministic output vectors of a draft send swap, derived
/// over one contiguous counter range: send outputs first, change after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutputPlan {
    /// Keyset the outputs are bound to
    pub keyset_id: Id,
    /// First counter value of the reserved range
    pub keyset_counter: u32,
    /// Denominations of the proofs to send
    pub send_output_amounts: Vec<Amount>,
    /// Denominations of the change returned to the account
    pub change_output_amounts: Vec<Amount>,
}

impl SendOutputPlan {
    /// Number of counter values the plan spans
    pub fn count(&self) -> u32 {
        (self.send_output_amounts.len() + self.change_output_amounts.len()) as u32
    }
}

/// State of a send swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashuSendSwapState {
    /// Inputs reserved; the swap with the mint is not committed yet
    Draft(SendOutputPlan),
    /// Proofs-to-send exist and await the recipient's claim
    Pending {
        /// Identity of the produced token
        token_hash: String,
        /// Y values of the proofs committed to the token
        proofs_to_send_ys: Vec<PublicKey>,
    },
    /// Recipient claimed the token
    Completed {
        /// Identity of the produced token
        token_hash: String,
    },
    /// Failed before proofs-to-send existed; inputs released
    Failed {
        /// Why the swap failed
        reason: String,
    },
    /// Sender reclaimed the proofs through a token swap of the same
    /// token
    Reversed {
        /// Identity of the produced token
        token_hash: String,
    },
}

/// Production of a sendable sub-token from account proofs.
///
/// The draft path swaps reserved inputs at the mint into an exact send
/// set plus change. The exact path skips the mint round-trip when the
/// selected inputs already sum to the amount to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashuSendSwap {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Spending account
    pub account_id: Uuid,
    /// User-visible transaction this record projects into
    pub transaction_id: Uuid,
    /// Amount the user asked to send
    pub amount_requested: Amount,
    /// Amount the token will carry
    pub amount_to_send: Amount,
    /// Swap fee the sender pays to produce the token
    pub cashu_send_fee: Amount,
    /// Swap fee the recipient will pay to claim, shown to the sender
    pub cashu_receive_fee: Amount,
    /// Total deducted from the account: amount_to_send + cashu_send_fee
    pub total_amount: Amount,
    /// Y values of the reserved input proofs
    pub input_proof_ys: Vec<PublicKey>,
    /// Total value of the reserved inputs
    pub input_amount: Amount,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// Lifecycle state
    #[serde(flatten)]
    pub state: CashuSendSwapState,
}

impl CashuSendSwap {
    /// New draft swap: inputs reserved, output plan recorded, mint
    /// round-trip still ahead.
    #[allow(clippy::too_many_arguments)]
    pub fn new_draft(
        user_id: impl Into<String>,
        account_id: Uuid,
        amount_requested: Amount,
        amount_to_send: Amount,
        cashu_send_fee: Amount,
        cashu_receive_fee: Amount,
        input_proof_ys: Vec<PublicKey>,
        input_amount: Amount,
        plan: SendOutputPlan,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            transaction_id: Uuid::new_v4(),
            amount_requested,
            amount_to_send,
            cashu_send_fee,
            cashu_receive_fee,
            total_amount: amount_to_send + cashu_send_fee,
            input_proof_ys,
            input_amount,
            created_at: unix_time(),
            version: 0,
            state: CashuSendSwapState::Draft(plan),
        }
    }

    /// New exact-path swap: the inputs are the proofs to send, no mint
    /// round-trip required.
    #[allow(clippy::too_many_arguments)]
    pub fn new_exact(
        user_id: impl Into<String>,
        account_id: Uuid,
        amount_requested: Amount,
        amount_to_send: Amount,
        cashu_receive_fee: Amount,
        input_proof_ys: Vec<PublicKey>,
        input_amount: Amount,
        token_hash: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            transaction_id: Uuid::new_v4(),
            amount_requested,
            amount_to_send,
            cashu_send_fee: Amount::ZERO,
            cashu_receive_fee,
            total_amount: amount_to_send,
            input_proof_ys: input_proof_ys.clone(),
            input_amount,
            created_at: unix_time(),
            version: 0,
            state: CashuSendSwapState::Pending {
                token_hash,
                proofs_to_send_ys: input_proof_ys,
            },
        }
    }

    /// Clear state tag for indexing
    pub fn state_tag(&self) -> &'static str {
        match &self.state {
            CashuSendSwapState::Draft(_) => "DRAFT",
            CashuSendSwapState::Pending { .. } => "PENDING",
            CashuSendSwapState::Completed { .. } => "COMPLETED",
            CashuSendSwapState::Failed { .. } => "FAILED",
            CashuSendSwapState::Reversed { .. } => "REVERSED",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CashuSendSwapState::Completed { .. }
                | CashuSendSwapState::Failed { .. }
                | CashuSendSwapState::Reversed { .. }
        )
    }

    /// Token hash, once the swap is committed
    pub fn token_hash(&self) -> Option<&str> {
        match &self.state {
            CashuSendSwapState::Draft(_) | CashuSendSwapState::Failed { .. } => None,
            CashuSendSwapState::Pending { token_hash, .. }
            | CashuSendSwapState::Completed { token_hash }
            | CashuSendSwapState::Reversed { token_hash } => Some(token_hash),
        }
    }

    fn transition_error(&self, attempted: &str) -> Error {
        Error::InvalidStateTransition {
            record: "cashu send swap",
            detail: format!("{attempted} from {}", self.state_tag()),
        }
    }

    /// DRAFT → PENDING, committing the proofs-to-send
    pub fn commit_proofs_to_send(
        &mut self,
        token_hash: String,
        proofs_to_send_ys: Vec<PublicKey>,
    ) -> Result<(), Error> {
        match self.state {
            CashuSendSwapState::Draft(_) => {
                self.state = CashuSendSwapState::Pending {
                    token_hash,
                    proofs_to_send_ys,
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("commit_proofs_to_send")),
        }
    }

    /// PENDING → COMPLETED when the recipient's claim is observed
    pub fn complete(&mut self) -> Result<(), Error> {
        match &self.state {
            CashuSendSwapState::Pending { token_hash, .. } => {
                self.state = CashuSendSwapState::Completed {
                    token_hash: token_hash.clone(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("complete")),
        }
    }

    /// PENDING → REVERSED once the reclaim token swap completed
    pub fn reverse(&mut self) -> Result<(), Error> {
        match &self.state {
            CashuSendSwapState::Pending { token_hash, .. } => {
                self.state = CashuSendSwapState::Reversed {
                    token_hash: token_hash.clone(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("reverse")),
        }
    }

    /// DRAFT → FAILED; inputs release.
    ///
    /// A PENDING swap cannot fail: its proofs-to-send are live bearer
    /// money and must be claimed or reversed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        match self.state {
            CashuSendSwapState::Draft(_) => {
                self.state = CashuSendSwapState::Failed {
                    reason: reason.into(),
                };
                self.version += 1;
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }
}

impl Validate for CashuSendSwap {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.input_proof_ys.is_empty() {
            return Err(ValidationError::new("no input proofs"));
        }
        if self.total_amount != self.amount_to_send + self.cashu_send_fee {
            return Err(ValidationError::new(
                "total_amount != amount_to_send + cashu_send_fee",
            ));
        }
        if self.input_amount < self.total_amount {
            return Err(ValidationError::new("inputs do not cover total_amount"));
        }
        match &self.state {
            CashuSendSwapState::Draft(plan) => {
                let send_total: Amount = plan.send_output_amounts.iter().copied().sum();
                if send_total != self.amount_to_send {
                    return Err(ValidationError::new(
                        "send outputs do not sum to amount_to_send",
                    ));
                }
            }
            CashuSendSwapState::Pending {
                token_hash,
                proofs_to_send_ys,
            } => {
                require_hex(token_hash, 64, "token_hash")?;
                if proofs_to_send_ys.is_empty() {
                    return Err(ValidationError::new("proofs_to_send_ys are empty"));
                }
            }
            CashuSendSwapState::Completed { token_hash }
            | CashuSendSwapState::Reversed { token_hash } => {
                require_hex(token_hash, 64, "token_hash")?;
            }
            CashuSendSwapState::Failed { reason } => {
                if reason.is_empty() {
                    return Err(ValidationError::new("failure reason is empty"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::SECP256K1;

    fn y(byte: u8) -> PublicKey {
        crate::proof::SecretKey::from_slice(&[byte; 32])
            .unwrap()
            .public_key(&SECP256K1)
    }

    fn draft() -> CashuSendSwap {
        CashuSendSwap::new_draft(
            "user-1",
            Uuid::new_v4(),
            Amount::from(70),
            Amount::from(70),
            Amount::from(2),
            Amount::from(1),
            vec![y(1), y(2), y(3)],
            Amount::from(73),
            SendOutputPlan {
                keyset_id: Id::from_str("00deadbeef123456").unwrap(),
                keyset_counter: 0,
                send_output_amounts: vec![Amount::from(64), Amount::from(4), Amount::from(2)],
                change_output_amounts: vec![Amount::from(1)],
            },
        )
    }

    #[test]
    fn draft_path_lifecycle() {
        let mut swap = draft();
        assert_eq!(swap.state_tag(), "DRAFT");
        assert_eq!(swap.total_amount, Amount::from(72));
        swap.validate().unwrap();

        swap.commit_proofs_to_send("ab".repeat(32), vec![y(10), y(11), y(12)])
            .unwrap();
        assert_eq!(swap.state_tag(), "PENDING");
        assert_eq!(swap.token_hash(), Some("ab".repeat(32).as_str()));

        swap.complete().unwrap();
        assert_eq!(swap.state_tag(), "COMPLETED");
        assert_eq!(swap.version, 2);
    }

    #[test]
    fn exact_path_starts_pending() {
        let swap = CashuSendSwap::new_exact(
            "user-1",
            Uuid::new_v4(),
            Amount::from(72),
            Amount::from(72),
            Amount::from(1),
            vec![y(1), y(2)],
            Amount::from(72),
            "cd".repeat(32),
        );
        assert_eq!(swap.state_tag(), "PENDING");
        assert_eq!(swap.cashu_send_fee, Amount::ZERO);
        swap.validate().unwrap();
    }

    #[test]
    fn pending_cannot_fail_but_can_reverse() {
        let mut swap = draft();
        swap.commit_proofs_to_send("ab".repeat(32), vec![y(10)])
            .unwrap();
        assert!(swap.fail("nope").is_err());
        swap.reverse().unwrap();
        assert_eq!(swap.state_tag(), "REVERSED");
    }

    #[test]
    fn draft_can_fail_and_is_terminal() {
        let mut swap = draft();
        swap.fail("mint unreachable").unwrap();
        assert!(swap.is_terminal());
        assert!(swap.commit_proofs_to_send("ab".repeat(32), vec![]).is_err());
    }
}
