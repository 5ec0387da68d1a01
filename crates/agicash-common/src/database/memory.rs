//! In-memory reference store
//!
//! Implements every storage procedure over a single mutex-guarded
//! world. Records are held the way a hosted store would hold them:
//! clear index columns plus a sealed blob, round-tripped through the
//! record codec on every read, so schema and invariant validation run
//! continuously.
//!
//! Procedures validate and seal first, then mutate; a procedure that
//! returns an error has not changed the world.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::{Database, RecordChange, RecordKind};
use crate::account::{Account, AccountDetails};
use crate::amount::{Amount, Money};
use crate::codec::{EncryptedData, RecordCodec, Validate};
use crate::error::Error;
use crate::keyset::Id;
use crate::proof::{ProofRecord, ProofState, PublicKey};
use crate::records::{
    CashuReceiveQuote, CashuSendQuote, CashuSendSwap, CashuSendSwapState, CashuTokenSwap,
    MintedOutputs, ReceiveKind, SparkReceiveQuote, SparkSendQuote, Transaction,
    TransactionDirection, TransactionKind, TransactionState,
};
use crate::util::unix_time;

/// A record as the store holds it: clear index columns plus the sealed
/// blob of everything else.
#[derive(Debug, Clone)]
struct SealedRow {
    user_id: String,
    account_id: Uuid,
    terminal: bool,
    /// Insertion sequence; assigned once on first store and kept
    /// across updates. Proof reads sort on it so coin-selection ties
    /// break by insertion order.
    seq: u64,
    blob: EncryptedData,
}

/// What the store needs to know about a record without opening it
trait StoredRecord: Serialize + DeserializeOwned + Validate + Clone {
    const KIND: RecordKind;
    const NAME: &'static str;

    fn record_id(&self) -> Uuid;
    fn record_user_id(&self) -> &str;
    fn record_account_id(&self) -> Uuid;
    fn record_version(&self) -> u32;
    fn record_terminal(&self) -> bool;
}

macro_rules! impl_stored_record {
    ($ty:ty, $kind:expr, $name:literal, $account:ident) => {
        impl StoredRecord for $ty {
            const KIND: RecordKind = $kind;
            const NAME: &'static str = $name;

            fn record_id(&self) -> Uuid {
                self.id
            }
            fn record_user_id(&self) -> &str {
                &self.user_id
            }
            fn record_account_id(&self) -> Uuid {
                self.$account
            }
            fn record_version(&self) -> u32 {
                self.version
            }
            fn record_terminal(&self) -> bool {
                self.is_terminal()
            }
        }
    };
}

impl_stored_record!(
    CashuReceiveQuote,
    RecordKind::CashuReceiveQuote,
    "cashu receive quote",
    account_id
);
impl_stored_record!(
    SparkReceiveQuote,
    RecordKind::SparkReceiveQuote,
    "spark receive quote",
    account_id
);
impl_stored_record!(
    CashuSendQuote,
    RecordKind::CashuSendQuote,
    "cashu send quote",
    account_id
);
impl_stored_record!(
    SparkSendQuote,
    RecordKind::SparkSendQuote,
    "spark send quote",
    account_id
);
impl_stored_record!(
    CashuTokenSwap,
    RecordKind::CashuTokenSwap,
    "cashu token swap",
    account_id
);
impl_stored_record!(
    CashuSendSwap,
    RecordKind::CashuSendSwap,
    "cashu send swap",
    account_id
);

impl StoredRecord for Account {
    const KIND: RecordKind = RecordKind::Account;
    const NAME: &'static str = "account";

    fn record_id(&self) -> Uuid {
        self.id
    }
    fn record_user_id(&self) -> &str {
        &self.user_id
    }
    fn record_account_id(&self) -> Uuid {
        self.id
    }
    fn record_version(&self) -> u32 {
        self.version
    }
    fn record_terminal(&self) -> bool {
        false
    }
}

impl Validate for ProofRecord {
    fn validate(&self) -> Result<(), crate::codec::ValidationError> {
        if self.state == ProofState::PendingSpend && !self.is_referenced() {
            return Err(crate::codec::ValidationError::new(
                "pending-spend proof has no spending record",
            ));
        }
        if self.spending_send_quote_id.is_some() && self.spending_send_swap_id.is_some() {
            return Err(crate::codec::ValidationError::new(
                "proof referenced by two spending records",
            ));
        }
        Ok(())
    }
}

impl StoredRecord for ProofRecord {
    const KIND: RecordKind = RecordKind::Proof;
    const NAME: &'static str = "proof";

    fn record_id(&self) -> Uuid {
        self.id
    }
    fn record_user_id(&self) -> &str {
        &self.user_id
    }
    fn record_account_id(&self) -> Uuid {
        self.account_id
    }
    fn record_version(&self) -> u32 {
        0
    }
    fn record_terminal(&self) -> bool {
        self.state == ProofState::Spent
    }
}

#[derive(Debug, Default)]
struct World {
    accounts: HashMap<Uuid, SealedRow>,
    locking_counters: HashMap<String, u32>,
    proofs: HashMap<Uuid, SealedRow>,
    /// Unique index over every proof ever inserted
    proof_ys: HashMap<PublicKey, Uuid>,
    cashu_receive_quotes: HashMap<Uuid, SealedRow>,
    spark_receive_quotes: HashMap<Uuid, SealedRow>,
    cashu_send_quotes: HashMap<Uuid, SealedRow>,
    spark_send_quotes: HashMap<Uuid, SealedRow>,
    cashu_token_swaps: HashMap<Uuid, SealedRow>,
    cashu_send_swaps: HashMap<Uuid, SealedRow>,
    /// Unique index over claimed tokens
    token_hashes: HashMap<String, Uuid>,
    /// Unique index over (user, payment hash) of outbound sends
    payment_hashes: HashMap<(String, String), Uuid>,
    transactions: HashMap<Uuid, Transaction>,
    /// Source of the per-row insertion sequence
    next_seq: u64,
}

/// In-memory [`Database`]
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    codec: RecordCodec,
    world: Arc<Mutex<World>>,
    changes: broadcast::Sender<RecordChange>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new(RecordCodec::passthrough())
    }
}

impl MemoryDatabase {
    /// New store sealing records with the given codec
    pub fn new(codec: RecordCodec) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            codec,
            world: Arc::new(Mutex::new(World::default())),
            changes,
        }
    }

    fn seal<T: StoredRecord>(&self, record: &T) -> Result<SealedRow, Error> {
        Ok(SealedRow {
            user_id: record.record_user_id().to_string(),
            account_id: record.record_account_id(),
            terminal: record.record_terminal(),
            seq: 0,
            blob: self.codec.seal(record)?,
        })
    }

    fn open<T: StoredRecord>(&self, row: &SealedRow) -> Result<T, Error> {
        self.codec.open(&row.blob)
    }

    /// Open a record for mutation, checking the caller's version
    fn open_checked<T: StoredRecord>(
        &self,
        map: &HashMap<Uuid, SealedRow>,
        id: Uuid,
        expected_version: u32,
    ) -> Result<T, Error> {
        let row = map
            .get(&id)
            .ok_or_else(|| Error::NotFound(T::NAME, id.to_string()))?;
        let record: T = self.open(row)?;
        if record.record_version() != expected_version {
            tracing::debug!(
                record = T::NAME,
                %id,
                expected_version,
                stored_version = record.record_version(),
                "version conflict"
            );
            return Err(Error::Concurrency {
                record: T::NAME,
                id: id.to_string(),
            });
        }
        Ok(record)
    }

    fn notify<T: StoredRecord>(&self, record: &T) {
        let _ = self.changes.send(RecordChange {
            kind: T::KIND,
            id: record.record_id(),
            version: record.record_version(),
        });
    }

    /// Signal that an account's proof set changed
    fn notify_proofs(&self, account_id: Uuid) {
        let _ = self.changes.send(RecordChange {
            kind: RecordKind::Proof,
            id: account_id,
            version: 0,
        });
    }

    // Account helpers

    fn load_account(&self, world: &World, account_id: Uuid) -> Result<Account, Error> {
        let row = world
            .accounts
            .get(&account_id)
            .ok_or_else(|| Error::NotFound("account", account_id.to_string()))?;
        self.open(row)
    }

    fn store_account(&self, world: &mut World, account: &Account) -> Result<(), Error> {
        let row = self.seal(account)?;
        world.accounts.insert(account.id, row);
        Ok(())
    }

    fn advance_counter(
        &self,
        world: &mut World,
        account_id: Uuid,
        keyset_id: Id,
        expected_start: u32,
        count: u32,
    ) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let mut account = self.load_account(world, account_id)?;
        account.advance_keyset_counter(keyset_id, expected_start, count)?;
        self.store_account(world, &account)?;
        self.notify(&account);
        Ok(())
    }

    // Proof helpers

    fn load_proof(&self, world: &World, id: Uuid) -> Result<ProofRecord, Error> {
        let row = world
            .proofs
            .get(&id)
            .ok_or_else(|| Error::NotFound("proof", id.to_string()))?;
        self.open(row)
    }

    fn load_proofs_by_ys(
        &self,
        world: &World,
        ys: &[PublicKey],
    ) -> Result<Vec<ProofRecord>, Error> {
        ys.iter()
            .map(|y| {
                let id = world
                    .proof_ys
                    .get(y)
                    .ok_or_else(|| Error::NotFound("proof", crate::util::hex::encode(y.serialize())))?;
                self.load_proof(world, *id)
            })
            .collect()
    }

    fn store_proof(&self, world: &mut World, record: &ProofRecord) -> Result<(), Error> {
        let mut row = self.seal(record)?;
        // First store fixes the insertion sequence; updates keep it
        row.seq = match world.proofs.get(&record.id) {
            Some(existing) => existing.seq,
            None => {
                world.next_seq += 1;
                world.next_seq
            }
        };
        world.proofs.insert(record.id, row);
        world.proof_ys.insert(record.y, record.id);
        Ok(())
    }

    /// Insert proofs that must be new, all-or-nothing
    fn insert_new_proofs(
        &self,
        world: &mut World,
        proofs: &[ProofRecord],
    ) -> Result<(), Error> {
        for proof in proofs {
            if world.proof_ys.contains_key(&proof.y) {
                return Err(Error::DuplicateProof(crate::util::hex::encode(
                    proof.y.serialize(),
                )));
            }
        }
        for proof in proofs {
            self.store_proof(world, proof)?;
        }
        Ok(())
    }

    /// UNSPENT → PENDING_SPEND, tagging the spending record
    fn reserve_proofs(
        &self,
        world: &mut World,
        ys: &[PublicKey],
        send_quote_id: Option<Uuid>,
        send_swap_id: Option<Uuid>,
    ) -> Result<(), Error> {
        let mut records = self.load_proofs_by_ys(world, ys)?;
        for record in &records {
            if !record.is_spendable() {
                return Err(Error::InvalidStateTransition {
                    record: "proof",
                    detail: format!("reserve of non-spendable proof {}", record.id),
                });
            }
        }
        let now = unix_time();
        for record in &mut records {
            record.state = ProofState::PendingSpend;
            record.reserved_at = Some(now);
            record.spending_send_quote_id = send_quote_id;
            record.spending_send_swap_id = send_swap_id;
            self.store_proof(world, record)?;
        }
        Ok(())
    }

    /// PENDING_SPEND → UNSPENT, clearing the spender tags
    fn release_proofs(&self, world: &mut World, ys: &[PublicKey]) -> Result<(), Error> {
        let mut records = self.load_proofs_by_ys(world, ys)?;
        for record in &mut records {
            if record.state != ProofState::PendingSpend {
                continue;
            }
            record.state = ProofState::Unspent;
            record.reserved_at = None;
            record.spending_send_quote_id = None;
            record.spending_send_swap_id = None;
            self.store_proof(world, record)?;
        }
        Ok(())
    }

    /// → SPENT, keeping the spender tag for audit
    fn consume_proofs(&self, world: &mut World, ys: &[PublicKey]) -> Result<(), Error> {
        let mut records = self.load_proofs_by_ys(world, ys)?;
        for record in &mut records {
            if record.state == ProofState::Spent {
                return Err(Error::InvalidStateTransition {
                    record: "proof",
                    detail: format!("consume of already spent proof {}", record.id),
                });
            }
        }
        for record in &mut records {
            record.state = ProofState::Spent;
            record.reserved_at = None;
            self.store_proof(world, record)?;
        }
        Ok(())
    }

    /// UNSPENT → UNSPENT tagged to a send swap (committed to a token)
    fn commit_proofs_to_swap(
        &self,
        world: &mut World,
        ys: &[PublicKey],
        swap_id: Uuid,
    ) -> Result<(), Error> {
        let mut records = self.load_proofs_by_ys(world, ys)?;
        for record in &records {
            if !record.is_spendable() {
                return Err(Error::InvalidStateTransition {
                    record: "proof",
                    detail: format!("commit of non-spendable proof {}", record.id),
                });
            }
        }
        for record in &mut records {
            record.spending_send_swap_id = Some(swap_id);
            self.store_proof(world, record)?;
        }
        Ok(())
    }

    fn proofs_of_account(
        &self,
        world: &World,
        account_id: Uuid,
        states: &Option<Vec<ProofState>>,
    ) -> Result<Vec<ProofRecord>, Error> {
        let mut records = Vec::new();
        for row in world.proofs.values() {
            if row.account_id != account_id {
                continue;
            }
            let record: ProofRecord = self.open(row)?;
            if let Some(states) = states {
                if !states.contains(&record.state) {
                    continue;
                }
            }
            records.push((row.seq, record));
        }
        // Insertion order: coin-selection ties break on it
        records.sort_by_key(|(seq, _)| *seq);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    // Transaction projection helpers

    fn account_money(&self, world: &World, account_id: Uuid, amount: Amount) -> Result<Money, Error> {
        let account = self.load_account(world, account_id)?;
        Ok(Money::new(amount, account.currency))
    }

    fn project(&self, world: &mut World, transaction: Transaction) {
        world.transactions.insert(transaction.id, transaction);
    }

    fn project_state(tag: &str) -> TransactionState {
        match tag {
            "COMPLETED" => TransactionState::Completed,
            "EXPIRED" => TransactionState::Expired,
            "FAILED" => TransactionState::Failed,
            "REVERSED" => TransactionState::Reversed,
            _ => TransactionState::Pending,
        }
    }

    fn project_cashu_receive(&self, world: &mut World, quote: &CashuReceiveQuote) {
        let kind = match quote.kind {
            ReceiveKind::Lightning => TransactionKind::Lightning,
            ReceiveKind::CashuToken(_) => TransactionKind::CashuToken,
        };
        self.project(
            world,
            Transaction {
                id: quote.transaction_id,
                user_id: quote.user_id.clone(),
                account_id: quote.account_id,
                direction: TransactionDirection::Incoming,
                kind,
                state: Self::project_state(quote.state_tag()),
                amount: quote.amount,
                fee: quote.total_fee,
                created_at: quote.created_at,
                updated_at: unix_time(),
            },
        );
    }

    fn project_spark_receive(&self, world: &mut World, quote: &SparkReceiveQuote) {
        let kind = match quote.kind {
            ReceiveKind::Lightning => TransactionKind::Lightning,
            ReceiveKind::CashuToken(_) => TransactionKind::CashuToken,
        };
        self.project(
            world,
            Transaction {
                id: quote.transaction_id,
                user_id: quote.user_id.clone(),
                account_id: quote.account_id,
                direction: TransactionDirection::Incoming,
                kind,
                state: Self::project_state(quote.state_tag()),
                amount: quote.amount,
                fee: Amount::ZERO,
                created_at: quote.created_at,
                updated_at: unix_time(),
            },
        );
    }

    fn project_cashu_send(&self, world: &mut World, quote: &CashuSendQuote) {
        let fee = match &quote.state {
            crate::records::CashuSendQuoteState::Completed { fee, .. } => *fee,
            _ => quote.estimated_fee,
        };
        self.project(
            world,
            Transaction {
                id: quote.transaction_id,
                user_id: quote.user_id.clone(),
                account_id: quote.account_id,
                direction: TransactionDirection::Outgoing,
                kind: TransactionKind::Lightning,
                state: Self::project_state(quote.state_tag()),
                amount: quote.amount,
                fee,
                created_at: quote.created_at,
                updated_at: unix_time(),
            },
        );
    }

    fn project_spark_send(&self, world: &mut World, quote: &SparkSendQuote) {
        let fee = match &quote.state {
            crate::records::SparkSendQuoteState::Completed { fee, .. } => *fee,
            _ => quote.estimated_fee,
        };
        self.project(
            world,
            Transaction {
                id: quote.transaction_id,
                user_id: quote.user_id.clone(),
                account_id: quote.account_id,
                direction: TransactionDirection::Outgoing,
                kind: TransactionKind::Lightning,
                state: Self::project_state(quote.state_tag()),
                amount: quote.amount,
                fee,
                created_at: quote.created_at,
                updated_at: unix_time(),
            },
        );
    }

    fn project_token_swap(
        &self,
        world: &mut World,
        swap: &CashuTokenSwap,
    ) -> Result<(), Error> {
        let amount = self.account_money(world, swap.account_id, swap.amount_received)?;
        self.project(
            world,
            Transaction {
                id: swap.transaction_id,
                user_id: swap.user_id.clone(),
                account_id: swap.account_id,
                direction: TransactionDirection::Incoming,
                kind: TransactionKind::CashuToken,
                state: Self::project_state(swap.state_tag()),
                amount,
                fee: swap.fee_amount,
                created_at: swap.created_at,
                updated_at: unix_time(),
            },
        );
        Ok(())
    }

    fn project_send_swap(&self, world: &mut World, swap: &CashuSendSwap) -> Result<(), Error> {
        let amount = self.account_money(world, swap.account_id, swap.amount_to_send)?;
        self.project(
            world,
            Transaction {
                id: swap.transaction_id,
                user_id: swap.user_id.clone(),
                account_id: swap.account_id,
                direction: TransactionDirection::Outgoing,
                kind: TransactionKind::CashuToken,
                state: Self::project_state(swap.state_tag()),
                amount,
                fee: swap.cashu_send_fee,
                created_at: swap.created_at,
                updated_at: unix_time(),
            },
        );
        Ok(())
    }

    fn list_unresolved<T: StoredRecord>(
        &self,
        map: &HashMap<Uuid, SealedRow>,
        user_id: &str,
    ) -> Result<Vec<T>, Error> {
        let mut records = Vec::new();
        for row in map.values() {
            if row.terminal || row.user_id != user_id {
                continue;
            }
            records.push(self.open(row)?);
        }
        Ok(records)
    }

    /// Seed proofs directly, bypassing the record procedures.
    ///
    /// For tests and data import; the unique index on `y` still
    /// applies.
    pub async fn seed_proofs(&self, proofs: Vec<ProofRecord>) -> Result<(), Error> {
        let mut world = self.world.lock().await;
        self.insert_new_proofs(&mut world, &proofs)
    }

    fn check_payment_hash_free(
        &self,
        world: &World,
        user_id: &str,
        payment_hash: &str,
    ) -> Result<(), Error> {
        if world
            .payment_hashes
            .contains_key(&(user_id.to_string(), payment_hash.to_string()))
        {
            return Err(Error::DuplicatePaymentHash(payment_hash.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn add_account(&self, account: Account) -> Result<Account, Error> {
        let mut world = self.world.lock().await;
        if let AccountDetails::Cashu(details) = &account.details {
            for row in world.accounts.values() {
                if row.user_id != account.user_id {
                    continue;
                }
                let existing: Account = self.open(row)?;
                if existing.currency != account.currency {
                    continue;
                }
                if let AccountDetails::Cashu(existing_details) = &existing.details {
                    if existing_details.mint_url == details.mint_url {
                        return Err(Error::Custom(format!(
                            "account for mint {} already exists",
                            details.mint_url
                        )));
                    }
                }
            }
        }
        self.store_account(&mut world, &account)?;
        self.notify(&account);
        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, Error> {
        let world = self.world.lock().await;
        world
            .accounts
            .get(&account_id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>, Error> {
        let world = self.world.lock().await;
        world
            .accounts
            .values()
            .filter(|row| row.user_id == user_id)
            .map(|row| self.open(row))
            .collect()
    }

    async fn increment_locking_counter(&self, user_id: &str) -> Result<u32, Error> {
        let mut world = self.world.lock().await;
        let counter = world
            .locking_counters
            .entry(user_id.to_string())
            .or_insert(0);
        let index = *counter;
        *counter += 1;
        Ok(index)
    }

    async fn get_proofs(
        &self,
        account_id: Uuid,
        states: Option<Vec<ProofState>>,
    ) -> Result<Vec<ProofRecord>, Error> {
        let world = self.world.lock().await;
        self.proofs_of_account(&world, account_id, &states)
    }

    async fn get_proofs_by_ys(&self, ys: &[PublicKey]) -> Result<Vec<ProofRecord>, Error> {
        let world = self.world.lock().await;
        self.load_proofs_by_ys(&world, ys)
    }

    // Cashu receive quotes

    async fn create_cashu_receive_quote(
        &self,
        quote: CashuReceiveQuote,
    ) -> Result<CashuReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        // The account must exist for projections to resolve
        self.load_account(&world, quote.account_id)?;
        let row = self.seal(&quote)?;
        world.cashu_receive_quotes.insert(quote.id, row);
        self.project_cashu_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn get_cashu_receive_quote(
        &self,
        id: Uuid,
    ) -> Result<Option<CashuReceiveQuote>, Error> {
        let world = self.world.lock().await;
        world
            .cashu_receive_quotes
            .get(&id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn list_unresolved_cashu_receive_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuReceiveQuote>, Error> {
        let world = self.world.lock().await;
        self.list_unresolved(&world.cashu_receive_quotes, user_id)
    }

    async fn process_cashu_receive_quote_payment(
        &self,
        id: Uuid,
        expected_version: u32,
        outputs: MintedOutputs,
    ) -> Result<CashuReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuReceiveQuote =
            self.open_checked(&world.cashu_receive_quotes, id, expected_version)?;
        let keyset_id = outputs.keyset_id;
        let counter_start = outputs.keyset_counter;
        let count = outputs.count();
        quote.process_payment(outputs)?;
        self.advance_counter(&mut world, quote.account_id, keyset_id, counter_start, count)?;
        let row = self.seal(&quote)?;
        world.cashu_receive_quotes.insert(id, row);
        self.project_cashu_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn complete_cashu_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        proofs: Vec<ProofRecord>,
    ) -> Result<CashuReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuReceiveQuote =
            self.open_checked(&world.cashu_receive_quotes, id, expected_version)?;
        for proof in &proofs {
            if proof.account_id != quote.account_id {
                return Err(Error::Custom(
                    "proof account does not match quote account".to_string(),
                ));
            }
        }
        quote.complete()?;
        self.insert_new_proofs(&mut world, &proofs)?;
        let row = self.seal(&quote)?;
        world.cashu_receive_quotes.insert(id, row);
        self.project_cashu_receive(&mut world, &quote);
        self.notify(&quote);
        self.notify_proofs(quote.account_id);
        Ok(quote)
    }

    async fn expire_cashu_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuReceiveQuote =
            self.open_checked(&world.cashu_receive_quotes, id, expected_version)?;
        quote.expire()?;
        let row = self.seal(&quote)?;
        world.cashu_receive_quotes.insert(id, row);
        self.project_cashu_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn fail_cashu_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<CashuReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuReceiveQuote =
            self.open_checked(&world.cashu_receive_quotes, id, expected_version)?;
        quote.fail(reason)?;
        let row = self.seal(&quote)?;
        world.cashu_receive_quotes.insert(id, row);
        self.project_cashu_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn mark_cashu_receive_quote_melt_initiated(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuReceiveQuote =
            self.open_checked(&world.cashu_receive_quotes, id, expected_version)?;
        if quote.mark_melt_initiated()? {
            let row = self.seal(&quote)?;
            world.cashu_receive_quotes.insert(id, row);
            self.notify(&quote);
        }
        Ok(quote)
    }

    // Spark receive quotes

    async fn create_spark_receive_quote(
        &self,
        quote: SparkReceiveQuote,
    ) -> Result<SparkReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        self.load_account(&world, quote.account_id)?;
        let row = self.seal(&quote)?;
        world.spark_receive_quotes.insert(quote.id, row);
        self.project_spark_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn get_spark_receive_quote(
        &self,
        id: Uuid,
    ) -> Result<Option<SparkReceiveQuote>, Error> {
        let world = self.world.lock().await;
        world
            .spark_receive_quotes
            .get(&id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn list_unresolved_spark_receive_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<SparkReceiveQuote>, Error> {
        let world = self.world.lock().await;
        self.list_unresolved(&world.spark_receive_quotes, user_id)
    }

    async fn complete_spark_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        payment_preimage: String,
        spark_transfer_id: String,
    ) -> Result<SparkReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkReceiveQuote =
            self.open_checked(&world.spark_receive_quotes, id, expected_version)?;
        quote.complete(payment_preimage, spark_transfer_id)?;
        let row = self.seal(&quote)?;
        world.spark_receive_quotes.insert(id, row);
        self.project_spark_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn expire_spark_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<SparkReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkReceiveQuote =
            self.open_checked(&world.spark_receive_quotes, id, expected_version)?;
        quote.expire()?;
        let row = self.seal(&quote)?;
        world.spark_receive_quotes.insert(id, row);
        self.project_spark_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn fail_spark_receive_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<SparkReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkReceiveQuote =
            self.open_checked(&world.spark_receive_quotes, id, expected_version)?;
        quote.fail(reason)?;
        let row = self.seal(&quote)?;
        world.spark_receive_quotes.insert(id, row);
        self.project_spark_receive(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn mark_spark_receive_quote_melt_initiated(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<SparkReceiveQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkReceiveQuote =
            self.open_checked(&world.spark_receive_quotes, id, expected_version)?;
        if quote.mark_melt_initiated()? {
            let row = self.seal(&quote)?;
            world.spark_receive_quotes.insert(id, row);
            self.notify(&quote);
        }
        Ok(quote)
    }

    // Cashu send quotes

    async fn create_cashu_send_quote(
        &self,
        quote: CashuSendQuote,
    ) -> Result<CashuSendQuote, Error> {
        let mut world = self.world.lock().await;
        self.load_account(&world, quote.account_id)?;
        self.check_payment_hash_free(&world, &quote.user_id, &quote.payment_hash)?;
        self.reserve_proofs(&mut world, &quote.input_proof_ys, Some(quote.id), None)?;
        let row = self.seal(&quote)?;
        world.cashu_send_quotes.insert(quote.id, row);
        world.payment_hashes.insert(
            (quote.user_id.clone(), quote.payment_hash.clone()),
            quote.id,
        );
        self.project_cashu_send(&mut world, &quote);
        self.notify(&quote);
        self.notify_proofs(quote.account_id);
        Ok(quote)
    }

    async fn get_cashu_send_quote(&self, id: Uuid) -> Result<Option<CashuSendQuote>, Error> {
        let world = self.world.lock().await;
        world
            .cashu_send_quotes
            .get(&id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn list_unresolved_cashu_send_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuSendQuote>, Error> {
        let world = self.world.lock().await;
        self.list_unresolved(&world.cashu_send_quotes, user_id)
    }

    async fn mark_cashu_send_quote_as_pending(
        &self,
        id: Uuid,
        expected_version: u32,
        keyset_id: Id,
        keyset_counter: u32,
        change_output_amounts: Vec<Amount>,
    ) -> Result<CashuSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuSendQuote =
            self.open_checked(&world.cashu_send_quotes, id, expected_version)?;
        let count = change_output_amounts.len() as u32;
        quote.mark_as_pending(keyset_id, keyset_counter, change_output_amounts)?;
        self.advance_counter(&mut world, quote.account_id, keyset_id, keyset_counter, count)?;
        let row = self.seal(&quote)?;
        world.cashu_send_quotes.insert(id, row);
        self.project_cashu_send(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn complete_cashu_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        fee: Amount,
        payment_preimage: Option<String>,
        change_proofs: Vec<ProofRecord>,
    ) -> Result<CashuSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuSendQuote =
            self.open_checked(&world.cashu_send_quotes, id, expected_version)?;
        let change_amount = change_proofs.iter().map(|p| p.proof.amount).sum();
        quote.complete(fee, payment_preimage, change_amount)?;
        // Settlement and the ledger mutation commit together: no window
        // in which the payment is settled but the inputs are unspent
        self.insert_new_proofs(&mut world, &change_proofs)?;
        self.consume_proofs(&mut world, &quote.input_proof_ys)?;
        let row = self.seal(&quote)?;
        world.cashu_send_quotes.insert(id, row);
        self.project_cashu_send(&mut world, &quote);
        self.notify(&quote);
        self.notify_proofs(quote.account_id);
        Ok(quote)
    }

    async fn expire_cashu_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuSendQuote =
            self.open_checked(&world.cashu_send_quotes, id, expected_version)?;
        quote.expire()?;
        self.release_proofs(&mut world, &quote.input_proof_ys)?;
        let row = self.seal(&quote)?;
        world.cashu_send_quotes.insert(id, row);
        self.project_cashu_send(&mut world, &quote);
        self.notify(&quote);
        self.notify_proofs(quote.account_id);
        Ok(quote)
    }

    async fn fail_cashu_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
        release_inputs: bool,
    ) -> Result<CashuSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: CashuSendQuote =
            self.open_checked(&world.cashu_send_quotes, id, expected_version)?;
        let release = release_inputs || quote.releases_inputs_on_abort();
        quote.fail(reason)?;
        if release {
            self.release_proofs(&mut world, &quote.input_proof_ys)?;
        }
        let row = self.seal(&quote)?;
        world.cashu_send_quotes.insert(id, row);
        self.project_cashu_send(&mut world, &quote);
        self.notify(&quote);
        self.notify_proofs(quote.account_id);
        Ok(quote)
    }

    async fn resolve_failed_cashu_send_quote_inputs(
        &self,
        id: Uuid,
        consume: bool,
    ) -> Result<CashuSendQuote, Error> {
        let mut world = self.world.lock().await;
        let row = world
            .cashu_send_quotes
            .get(&id)
            .ok_or_else(|| Error::NotFound("cashu send quote", id.to_string()))?;
        let quote: CashuSendQuote = self.open(row)?;
        if quote.state_tag() != "FAILED" {
            return Err(Error::InvalidStateTransition {
                record: "cashu send quote",
                detail: format!("resolve inputs from {}", quote.state_tag()),
            });
        }
        if consume {
            self.consume_proofs(&mut world, &quote.input_proof_ys)?;
        } else {
            self.release_proofs(&mut world, &quote.input_proof_ys)?;
        }
        self.notify_proofs(quote.account_id);
        Ok(quote)
    }

    // Spark send quotes

    async fn create_spark_send_quote(
        &self,
        quote: SparkSendQuote,
    ) -> Result<SparkSendQuote, Error> {
        let mut world = self.world.lock().await;
        self.load_account(&world, quote.account_id)?;
        self.check_payment_hash_free(&world, &quote.user_id, &quote.payment_hash)?;
        let row = self.seal(&quote)?;
        world.spark_send_quotes.insert(quote.id, row);
        world.payment_hashes.insert(
            (quote.user_id.clone(), quote.payment_hash.clone()),
            quote.id,
        );
        self.project_spark_send(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn get_spark_send_quote(&self, id: Uuid) -> Result<Option<SparkSendQuote>, Error> {
        let world = self.world.lock().await;
        world
            .spark_send_quotes
            .get(&id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn list_unresolved_spark_send_quotes(
        &self,
        user_id: &str,
    ) -> Result<Vec<SparkSendQuote>, Error> {
        let world = self.world.lock().await;
        self.list_unresolved(&world.spark_send_quotes, user_id)
    }

    async fn mark_spark_send_quote_as_pending(
        &self,
        id: Uuid,
        expected_version: u32,
        spark_id: String,
    ) -> Result<SparkSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkSendQuote =
            self.open_checked(&world.spark_send_quotes, id, expected_version)?;
        quote.mark_as_pending(spark_id)?;
        let row = self.seal(&quote)?;
        world.spark_send_quotes.insert(id, row);
        self.project_spark_send(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn complete_spark_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        fee: Amount,
        payment_preimage: String,
    ) -> Result<SparkSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkSendQuote =
            self.open_checked(&world.spark_send_quotes, id, expected_version)?;
        quote.complete(fee, payment_preimage)?;
        let row = self.seal(&quote)?;
        world.spark_send_quotes.insert(id, row);
        self.project_spark_send(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn expire_spark_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<SparkSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkSendQuote =
            self.open_checked(&world.spark_send_quotes, id, expected_version)?;
        quote.expire()?;
        let row = self.seal(&quote)?;
        world.spark_send_quotes.insert(id, row);
        self.project_spark_send(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    async fn fail_spark_send_quote(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<SparkSendQuote, Error> {
        let mut world = self.world.lock().await;
        let mut quote: SparkSendQuote =
            self.open_checked(&world.spark_send_quotes, id, expected_version)?;
        quote.fail(reason)?;
        let row = self.seal(&quote)?;
        world.spark_send_quotes.insert(id, row);
        self.project_spark_send(&mut world, &quote);
        self.notify(&quote);
        Ok(quote)
    }

    // Cashu token swaps

    async fn create_cashu_token_swap(
        &self,
        swap: CashuTokenSwap,
    ) -> Result<CashuTokenSwap, Error> {
        let mut world = self.world.lock().await;
        self.load_account(&world, swap.account_id)?;
        if world.token_hashes.contains_key(&swap.token_hash) {
            return Err(Error::TokenAlreadyClaimed);
        }
        self.advance_counter(
            &mut world,
            swap.account_id,
            swap.keyset_id,
            swap.keyset_counter,
            swap.output_amounts.len() as u32,
        )?;
        let row = self.seal(&swap)?;
        world.cashu_token_swaps.insert(swap.id, row);
        world.token_hashes.insert(swap.token_hash.clone(), swap.id);
        self.project_token_swap(&mut world, &swap)?;
        self.notify(&swap);
        Ok(swap)
    }

    async fn get_cashu_token_swap(&self, id: Uuid) -> Result<Option<CashuTokenSwap>, Error> {
        let world = self.world.lock().await;
        world
            .cashu_token_swaps
            .get(&id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn get_cashu_token_swap_by_token_hash(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<CashuTokenSwap>, Error> {
        let world = self.world.lock().await;
        let Some(id) = world.token_hashes.get(token_hash) else {
            return Ok(None);
        };
        let Some(row) = world.cashu_token_swaps.get(id) else {
            return Ok(None);
        };
        if row.user_id != user_id {
            return Ok(None);
        }
        self.open(row).map(Some)
    }

    async fn list_unresolved_cashu_token_swaps(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuTokenSwap>, Error> {
        let world = self.world.lock().await;
        self.list_unresolved(&world.cashu_token_swaps, user_id)
    }

    async fn complete_cashu_token_swap(
        &self,
        id: Uuid,
        expected_version: u32,
        proofs: Vec<ProofRecord>,
    ) -> Result<CashuTokenSwap, Error> {
        let mut world = self.world.lock().await;
        let mut swap: CashuTokenSwap =
            self.open_checked(&world.cashu_token_swaps, id, expected_version)?;
        swap.complete()?;
        self.insert_new_proofs(&mut world, &proofs)?;
        let row = self.seal(&swap)?;
        world.cashu_token_swaps.insert(id, row);
        self.project_token_swap(&mut world, &swap)?;
        self.notify(&swap);
        self.notify_proofs(swap.account_id);
        Ok(swap)
    }

    async fn fail_cashu_token_swap(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<CashuTokenSwap, Error> {
        let mut world = self.world.lock().await;
        let mut swap: CashuTokenSwap =
            self.open_checked(&world.cashu_token_swaps, id, expected_version)?;
        swap.fail(reason)?;
        let row = self.seal(&swap)?;
        world.cashu_token_swaps.insert(id, row);
        self.project_token_swap(&mut world, &swap)?;
        self.notify(&swap);
        Ok(swap)
    }

    // Cashu send swaps

    async fn create_cashu_send_swap(&self, swap: CashuSendSwap) -> Result<CashuSendSwap, Error> {
        let mut world = self.world.lock().await;
        self.load_account(&world, swap.account_id)?;
        match &swap.state {
            CashuSendSwapState::Draft(plan) => {
                // Validate the reservation before the counter advance
                // mutates anything, so a failure leaves no partial state
                let records = self.load_proofs_by_ys(&world, &swap.input_proof_ys)?;
                if let Some(record) = records.iter().find(|r| !r.is_spendable()) {
                    return Err(Error::InvalidStateTransition {
                        record: "proof",
                        detail: format!("reserve of non-spendable proof {}", record.id),
                    });
                }
                self.advance_counter(
                    &mut world,
                    swap.account_id,
                    plan.keyset_id,
                    plan.keyset_counter,
                    plan.count(),
                )?;
                self.reserve_proofs(&mut world, &swap.input_proof_ys, None, Some(swap.id))?;
            }
            CashuSendSwapState::Pending { .. } => {
                // Exact path: the inputs are the proofs to send
                self.commit_proofs_to_swap(&mut world, &swap.input_proof_ys, swap.id)?;
            }
            _ => {
                return Err(Error::InvalidStateTransition {
                    record: "cashu send swap",
                    detail: format!("create in state {}", swap.state_tag()),
                })
            }
        }
        let row = self.seal(&swap)?;
        world.cashu_send_swaps.insert(swap.id, row);
        self.project_send_swap(&mut world, &swap)?;
        self.notify(&swap);
        self.notify_proofs(swap.account_id);
        Ok(swap)
    }

    async fn get_cashu_send_swap(&self, id: Uuid) -> Result<Option<CashuSendSwap>, Error> {
        let world = self.world.lock().await;
        world
            .cashu_send_swaps
            .get(&id)
            .map(|row| self.open(row))
            .transpose()
    }

    async fn get_cashu_send_swap_by_token_hash(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<CashuSendSwap>, Error> {
        let world = self.world.lock().await;
        for row in world.cashu_send_swaps.values() {
            if row.user_id != user_id {
                continue;
            }
            let swap: CashuSendSwap = self.open(row)?;
            if swap.token_hash() == Some(token_hash) {
                return Ok(Some(swap));
            }
        }
        Ok(None)
    }

    async fn list_unresolved_cashu_send_swaps(
        &self,
        user_id: &str,
    ) -> Result<Vec<CashuSendSwap>, Error> {
        let world = self.world.lock().await;
        self.list_unresolved(&world.cashu_send_swaps, user_id)
    }

    async fn commit_proofs_to_send(
        &self,
        id: Uuid,
        expected_version: u32,
        token_hash: String,
        change_proofs: Vec<ProofRecord>,
        proofs_to_send: Vec<ProofRecord>,
    ) -> Result<CashuSendSwap, Error> {
        let mut world = self.world.lock().await;
        let mut swap: CashuSendSwap =
            self.open_checked(&world.cashu_send_swaps, id, expected_version)?;
        let mut proofs_to_send = proofs_to_send;
        for proof in &mut proofs_to_send {
            proof.spending_send_swap_id = Some(swap.id);
        }
        let send_ys: Vec<PublicKey> = proofs_to_send.iter().map(|p| p.y).collect();
        swap.commit_proofs_to_send(token_hash, send_ys)?;
        let mut inserted = change_proofs;
        inserted.extend(proofs_to_send);
        self.insert_new_proofs(&mut world, &inserted)?;
        self.consume_proofs(&mut world, &swap.input_proof_ys)?;
        let row = self.seal(&swap)?;
        world.cashu_send_swaps.insert(id, row);
        self.project_send_swap(&mut world, &swap)?;
        self.notify(&swap);
        self.notify_proofs(swap.account_id);
        Ok(swap)
    }

    async fn complete_cashu_send_swap(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuSendSwap, Error> {
        let mut world = self.world.lock().await;
        let mut swap: CashuSendSwap =
            self.open_checked(&world.cashu_send_swaps, id, expected_version)?;
        let send_ys = match &swap.state {
            CashuSendSwapState::Pending {
                proofs_to_send_ys, ..
            } => proofs_to_send_ys.clone(),
            _ => Vec::new(),
        };
        swap.complete()?;
        self.consume_proofs(&mut world, &send_ys)?;
        let row = self.seal(&swap)?;
        world.cashu_send_swaps.insert(id, row);
        self.project_send_swap(&mut world, &swap)?;
        self.notify(&swap);
        self.notify_proofs(swap.account_id);
        Ok(swap)
    }

    async fn reverse_cashu_send_swap(
        &self,
        id: Uuid,
        expected_version: u32,
    ) -> Result<CashuSendSwap, Error> {
        let mut world = self.world.lock().await;
        let mut swap: CashuSendSwap =
            self.open_checked(&world.cashu_send_swaps, id, expected_version)?;
        let send_ys = match &swap.state {
            CashuSendSwapState::Pending {
                proofs_to_send_ys, ..
            } => proofs_to_send_ys.clone(),
            _ => Vec::new(),
        };
        swap.reverse()?;
        self.consume_proofs(&mut world, &send_ys)?;
        let row = self.seal(&swap)?;
        world.cashu_send_swaps.insert(id, row);
        self.project_send_swap(&mut world, &swap)?;
        self.notify(&swap);
        self.notify_proofs(swap.account_id);
        Ok(swap)
    }

    async fn fail_cashu_send_swap(
        &self,
        id: Uuid,
        expected_version: u32,
        reason: String,
    ) -> Result<CashuSendSwap, Error> {
        let mut world = self.world.lock().await;
        let mut swap: CashuSendSwap =
            self.open_checked(&world.cashu_send_swaps, id, expected_version)?;
        swap.fail(reason)?;
        self.release_proofs(&mut world, &swap.input_proof_ys)?;
        let row = self.seal(&swap)?;
        world.cashu_send_swaps.insert(id, row);
        self.project_send_swap(&mut world, &swap)?;
        self.notify(&swap);
        self.notify_proofs(swap.account_id);
        Ok(swap)
    }

    // Transactions

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, Error> {
        let world = self.world.lock().await;
        Ok(world.transactions.get(&id).cloned())
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        account_id: Option<Uuid>,
    ) -> Result<Vec<Transaction>, Error> {
        let world = self.world.lock().await;
        let mut transactions: Vec<Transaction> = world
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| account_id.map(|id| t.account_id == id).unwrap_or(true))
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}
