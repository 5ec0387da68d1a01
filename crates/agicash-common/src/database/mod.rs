//! Storage procedures
//!
//! Every state transition is a named procedure over the storage layer.
//! Procedures are transactional: the record mutation, any proof-set
//! changes and any keyset-counter advance commit together or not at
//! all. Mutating procedures take the caller's `expected_version` and
//! fail with [`Error::Concurrency`] when the stored record has moved
//! on; the caller re-reads and retries (bounded).

use std::fmt::Debug;

use async_trait::async_trait;
use uuid::Uuid;

use crate::account::Account;
use crate::amount::Amount;
use crate::error::Error;
use crate::keyset::Id;
use crate::proof::{ProofRecord, ProofState, PublicKey};
use crate::records::{
    CashuReceiveQuote, CashuSendQuote, CashuSendSwap, CashuTokenSwap, MintedOutputs,
    SparkReceiveQuote, SparkSendQuote, Transaction,
};

pub mod memory;

pub use memory::MemoryDatabase;

/// Record classes, used in change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Account
    Account,
    /// Proof
    Proof,
    /// Cashu receive quote
    CashuReceiveQuote,
    /// Spark receive quote
    SparkReceiveQuote,
    /// Cashu send quote
    CashuSendQuote,
    /// Spark send quote
    SparkSendQuote,
    /// Cashu token swap
    CashuTokenSwap,
    /// Cashu send swap
    CashuSendSwap,
}

/// A change notification from the storage layer.
///
/// Consumers invalidate caches by id; the version lets them drop stale
/// notifications without a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordChange {
    /// Class of the changed record
    pub kind: RecordKind,
    /// Id of the changed record
    pub id: Uuid,
    /// Version after the change
    pub version: u32,
}

/// The storage procedure surface the engines drive.
///
/// Implementations are responsible for at-rest encryption of record
/// content through the record codec; callers only ever see decrypted,
/// validated records.
#[async_trait]
pub trait Database: Debug + Send + Sync {
    // Accounts

    /// Insert a new account.
    ///
    /// For cashu accounts `(mint_url, currency, user_id)` is unique.
    async fn add_account(&self, account: Account) -> Result<Account, Error>;

    /// Account by id
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, Error>;

    /// All accounts of a user
    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>, Error>;

    /// Advance and return the user's monotonic quote-locking index
    async fn increment_locking_counter(&self, user_id: &str) -> Result<u32, Error>;

    // Proofs

    /// Proofs of an account, optionally filtered by state.
    ///
    /// Returned in insertion order; coin selection relies on it to
    /// break ties between equal amounts.
    async fn get_proofs(
        &self,
        account_id: Uuid,
        states: Option<Vec<ProofState>>,
    ) -> Result<Vec<ProofRecord>, Error>;

    /// Proofs by their Y values
    async fn get_proofs_by_ys(&self, ys: &[PublicKey]) -> Result<Vec<ProofRecord>, Error>;

    // Cashu receive quotes

    /// Insert a receive quote in UNPAID
    async fn create_cashu_receive_quote(
        &self,
        quote: CashuReceiveQuote,
    ) -> Result<CashuReceiveQuote, Error>;

    /// Receive quote by id
    async fn get_cashu_receive_quote(&self, id: Uuid)
        -> Result<Option<CashuReceiveQuote>, Error>;

    /// Non-terminal receive quotes of a user
    async fn list_unresolved_cashu_receive_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuReceiveQuote>, Error>;

    /// UNPAID → PAID; atomically advances the account's keyset counter
    /// by the size of the allocation
    async fn process_cashu_receive_quote_payment(
        &self,
        id: Uuid,
        expected_version: u32,
        outputs: MintedOutputs,
    ) -> Result<CashuReceiveQuote, Error>;

    /// PAID → COMPLETED; atomically inserts the minted proofs
    async fn complete_cashu_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        proofs: Vec<ProofRecord>,
    ) -> Result<CashuReceiveQuote, Error>;

    /// UNPAID → EXPIRED
    async fn expire_cashu_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuReceiveQuote, Error>;

    /// UNPAID/PAID → FAILED
    async fn fail_cashu_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<CashuReceiveQuote, Error>;

    /// Set the cross-mint melt latch
    async fn mark_cashu_receive_quote_melt_initiated(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuReceiveQuote, Error>;

    // Spark receive quotes

    /// Insert a receive quote in UNPAID
    async fn create_spark_receive_quote(
        &self,
        quote: SparkReceiveQuote,
    ) -> Result<SparkReceiveQuote, Error>;

    /// Receive quote by id
    async fn get_spark_receive_quote(&self, id: Uuid)
        -> Result<Option<SparkReceiveQuote>, Error>;

    /// Non-terminal receive quotes of a user
    async fn list_unresolved_spark_receive_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<SparkReceiveQuote>, Error>;

    /// UNPAID → COMPLETED with the transfer outcome
    async fn complete_spark_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        payment_preimage: String,
        spark_transfer_id: String,
    ) -> Result<SparkReceiveQuote, Error>;

    /// UNPAID → EXPIRED
    async fn expire_spark_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<SparkReceiveQuote, Error>;

    /// UNPAID → FAILED
    async fn fail_spark_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<SparkReceiveQuote, Error>;

    /// Set the cross-mint melt latch
    async fn mark_spark_receive_quote_melt_initiated(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<SparkReceiveQuote, Error>;

    // Cashu send quotes

    /// Insert a send quote in UNPAID and reserve its input proofs.
    ///
    /// The payment hash must be unused by the user's other send
    /// records.
    async fn create_cashu_send_quote(
        &self,
        quote: CashuSendQuote,
    ) -> Result<CashuSendQuote, Error>;

    /// Send quote by id
    async fn get_cashu_send_quote(&self, id: Uuid) -> Result<Option<CashuSendQuote>, Error>;

    /// Non-terminal send quotes of a user
    async fn list_unresolved_cashu_send_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuSendQuote>, Error>;

    /// UNPAID → PENDING; atomically advances the keyset counter by the
    /// change-output count
    async fn mark_cashu_send_quote_as_pending(
        &self,
        id: Uuid,
        expected_version: u32,
        keyset_id: Id,
        keyset_counter: u32,
        change_output_amounts: Vec<Amount>,
    ) -> Result<CashuSendQuote, Error>;

    /// PENDING → COMPLETED; consumes the reserved inputs and inserts
    /// the change proofs in the same transaction as the settlement
    async fn complete_cashu_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        fee: Amount,
        payment_preimage: Option<String>,
        change_proofs: Vec<ProofRecord>,
    ) -> Result<CashuSendQuote, Error>;

    /// UNPAID → EXPIRED; releases the reserved inputs
    async fn expire_cashu_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuSendQuote, Error>;

    /// UNPAID/PENDING → FAILED.
    ///
    /// `release_inputs` distinguishes a definitive external failure
    /// (the melt never consumed the proofs, release them) from an
    /// ambiguous one after PENDING (park the proofs PENDING_SPEND for
    /// operator resolution).
    async fn fail_cashu_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
        release_inputs: bool,
    ) -> Result<CashuSendQuote, Error>;

    /// Operator resolution for a FAILED send quote whose inputs were
    /// parked: release them back to UNSPENT when the payment turned
    /// out not to have happened, or consume them as SPENT when it
    /// settled after all. Legal only on a FAILED quote.
    async fn resolve_failed_cashu_send_quote_inputs(
        &self,
        id: Uuid,
        consume: bool,
    ) -> Result<CashuSendQuote, Error>;

    // Spark send quotes

    /// Insert a send quote in UNPAID.
    ///
    /// The payment hash must be unused by the user's other send
    /// records.
    async fn create_spark_send_quote(
        &self,
        quote: SparkSendQuote,
    ) -> Result<SparkSendQuote, Error>;

    /// Send quote by id
    async fn get_spark_send_quote(&self, id: Uuid) -> Result<Option<SparkSendQuote>, Error>;

    /// Non-terminal send quotes of a user
    async fn list_unresolved_spark_send_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<SparkSendQuote>, Error>;

    /// UNPAID → PENDING with the external payment id
    async fn mark_spark_send_quote_as_pending(
        &self,
        id: Uuid,
        expected_version: u32,
        spark_id: String,
    ) -> Result<SparkSendQuote, Error>;

    /// PENDING → COMPLETED with the settlement outcome
    async fn complete_spark_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        fee: Amount,
        payment_preimage: String,
    ) -> Result<SparkSendQuote, Error>;

    /// UNPAID → EXPIRED
    async fn expire_spark_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<SparkSendQuote, Error>;

    /// UNPAID/PENDING → FAILED
    async fn fail_spark_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<SparkSendQuote, Error>;

    // Cashu token swaps

    /// Insert a token swap in PENDING.
    ///
    /// Fails with [`Error::TokenAlreadyClaimed`] when the token hash is
    /// already claimed; atomically advances the keyset counter by the
    /// output count.
    async fn create_cashu_token_swap(
        &self,
        swap: CashuTokenSwap,
    ) -> Result<CashuTokenSwap, Error>;

    /// Token swap by id
    async fn get_cashu_token_swap(&self, id: Uuid) -> Result<Option<CashuTokenSwap>, Error>;

    /// Token swap of a user by the hash of the token it claims
    async fn get_cashu_token_swap_by_token_hash(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<CashuTokenSwap>, Error>;

    /// Non-terminal token swaps of a user
    async fn list_unresolved_cashu_token_swaps(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuTokenSwap>, Error>;

    /// PENDING → COMPLETED; atomically inserts the swapped proofs
    async fn complete_cashu_token_swap(
        &self,
        id: Uuid,
        expected_version: u32,
        proofs: Vec<ProofRecord>,
    ) -> Result<CashuTokenSwap, Error>;

    /// PENDING → FAILED
    async fn fail_cashu_token_swap(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<CashuTokenSwap, Error>;

    // Cashu send swaps

    /// Insert a send swap.
    ///
    /// A draft reserves its inputs and advances the keyset counter by
    /// the output-plan size. An exact-path swap starts PENDING and
    /// commits its inputs as the proofs to send (kept UNSPENT, tagged
    /// to the swap, excluded from balance and selection).
    async fn create_cashu_send_swap(&self, swap: CashuSendSwap) -> Result<CashuSendSwap, Error>;

    /// Send swap by id
    async fn get_cashu_send_swap(&self, id: Uuid) -> Result<Option<CashuSendSwap>, Error>;

    /// Send swap by the hash of the token it produced
    async fn get_cashu_send_swap_by_token_hash(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<CashuSendSwap>, Error>;

    /// Non-terminal send swaps of a user
    async fn list_unresolved_cashu_send_swaps(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuSendSwap>, Error>;

    /// DRAFT → PENDING; consumes the inputs, inserts change as
    /// UNSPENT and the proofs-to-send as UNSPENT tagged to the swap
    async fn commit_proofs_to_send(
        &self,
        id: Uuid,
        expected_version: u32,
        token_hash: String,
        change_proofs: Vec<ProofRecord>,
        proofs_to_send: Vec<ProofRecord>,
    ) -> Result<CashuSendSwap, Error>;

    /// PENDING → COMPLETED; the proofs-to-send become SPENT
    async fn complete_cashu_send_swap(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuSendSwap, Error>;

    /// PENDING → REVERSED; the proofs-to-send become SPENT (they were
    /// consumed by the reclaiming token swap)
    async fn reverse_cashu_send_swap(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuSendSwap, Error>;

    /// DRAFT → FAILED; releases the reserved inputs
    async fn fail_cashu_send_swap(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<CashuSendSwap, Error>;

    // Transactions

    /// Transaction by id
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, Error>;

    /// Transactions of a user, newest first, optionally scoped to one
    /// account
    async fn list_transactions(
        &self,
        user_id: &str,
        account_id: Option<Uuid>,
    ) -> Result<Vec<Transaction>, Error>;

    // Change notifications

    /// Subscribe to record change notifications
    fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<RecordChange>;
}
