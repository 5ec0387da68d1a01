//! User-visible transaction projection
//!
//! A transaction mirrors the quote or swap record that references it
//! via `transaction_id`. It is maintained by the storage procedures as
//! a read projection and is never a source of truth.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{Amount, Money};

/// Direction of value flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionDirection {
    /// Value entering the account
    Incoming,
    /// Value leaving the account
    Outgoing,
}

/// What moved the value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// A Lightning payment (mint/melt quote or Spark transfer)
    Lightning,
    /// A cashu token changing hands
    CashuToken,
}

/// Projected state, derived from the underlying record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Underlying record is non-terminal
    Pending,
    /// Underlying record completed
    Completed,
    /// Underlying record expired
    Expired,
    /// Underlying record failed
    Failed,
    /// Underlying send swap was reversed
    Reversed,
}

/// One user-visible wallet transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id, referenced by the underlying record
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Account the value moved on
    pub account_id: Uuid,
    /// Direction of the flow
    pub direction: TransactionDirection,
    /// Kind of movement
    pub kind: TransactionKind,
    /// Projected state
    pub state: TransactionState,
    /// Amount moved
    pub amount: Money,
    /// Fee attributed to the movement
    pub fee: Amount,
    /// Creation time of the underlying record, unix seconds
    pub created_at: u64,
    /// Last projection update, unix seconds
    pub updated_at: u64,
}

impl Transaction {
    /// Whether the projection is settled one way or another
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, TransactionState::Pending)
    }
}
