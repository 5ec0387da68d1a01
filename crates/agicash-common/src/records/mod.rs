//! Durable per-operation records
//!
//! Each operation the wallet runs is coordinated by one durable record
//! with a small finite state machine. States are sum types carrying
//! exactly the data legal in that state; every transition bumps the
//! record `version` by one for optimistic locking.

pub mod receive;
pub mod send;
pub mod send_swap;
pub mod token_swap;
pub mod transaction;

pub use receive::{
    CashuReceiveQuote, CashuReceiveQuoteState, MintedOutputs, ReceiveKind, SparkReceiveQuote,
    SparkReceiveQuoteState, TokenReceiveData,
};
pub use send::{CashuSendQuote, CashuSendQuoteState, SparkSendQuote, SparkSendQuoteState};
pub use send_swap::{CashuSendSwap, CashuSendSwapState, SendOutputPlan};
pub use token_swap::{CashuTokenSwap, CashuTokenSwapState};
pub use transaction::{Transaction, TransactionDirection, TransactionKind, TransactionState};

fn require_hex(value: &str, len: usize, what: &str) -> Result<(), crate::codec::ValidationError> {
    if value.len() != len || crate::util::hex::decode(value).is_err() {
        return Err(crate::codec::ValidationError::new(format!(
            "{what} must be {len} hex chars"
        )));
    }
    Ok(())
}
