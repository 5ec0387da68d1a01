//! Account proof ledger
//!
//! Owns the view over an account's proof multiset: balance, coin
//! selection, deterministic output planning and restore matching. The
//! actual state transitions on proofs ride inside the storage
//! procedures of the record that causes them.

use std::sync::Arc;

use agicash_common::database::Database;
use agicash_common::dhke::unblind_message;
use agicash_common::keyset::Keys;
use agicash_common::mint::RestoreResponse;
use agicash_common::outputs::PreMintSecrets;
use agicash_common::proof::{Proof, ProofRecord, Proofs};
use agicash_common::{Account, Amount, Error};
use tracing::instrument;
use uuid::Uuid;

use crate::fees::input_fee;

/// Ledger view over the stored proofs
#[derive(Debug, Clone)]
pub struct ProofLedger {
    db: Arc<dyn Database>,
}

impl ProofLedger {
    /// New ledger over the storage procedures
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Spendable proofs of an account: UNSPENT and not committed to an
    /// outbound token. Storage insertion order is preserved for the
    /// coin-selection tie-break.
    pub async fn spendable_proofs(&self, account_id: Uuid) -> Result<Vec<ProofRecord>, Error> {
        let records = self.db.get_proofs(account_id, None).await?;
        Ok(records.into_iter().filter(|r| r.is_spendable()).collect())
    }

    /// The account's balance: sum of its spendable proofs.
    ///
    /// Never blocks on in-flight transitions; the storage snapshot it
    /// reads is consistent per record.
    #[instrument(skip(self))]
    pub async fn balance(&self, account_id: Uuid) -> Result<Amount, Error> {
        let proofs = self.spendable_proofs(account_id).await?;
        Amount::try_sum(proofs.iter().map(|r| r.proof.amount)).map_err(Error::from)
    }

    /// Build ledger records for freshly constructed proofs
    pub fn records_for(account: &Account, proofs: Proofs) -> Result<Vec<ProofRecord>, Error> {
        proofs
            .into_iter()
            .map(|proof| {
                ProofRecord::new(account.user_id.clone(), account.id, proof)
                    .map_err(|e| Error::Custom(e.to_string()))
            })
            .collect()
    }
}

/// Greedy coin selection over spendable proofs.
///
/// Prefers the largest proof that does not overshoot the outstanding
/// need, topping up with the smallest remaining proof when everything
/// left overshoots. The fee grows with the selection, so the need is
/// re-evaluated after every pick. Ties break by amount descending,
/// then insertion order ascending: `available` arrives in storage
/// insertion order (the [`Database::get_proofs`] contract) and the
/// sort is stable over it.
pub fn select_proofs(
    available: Vec<ProofRecord>,
    target: Amount,
    fee_ppk: u64,
) -> Result<Vec<ProofRecord>, Error> {
    let mut rest = available;
    rest.sort_by(|a, b| b.proof.amount.cmp(&a.proof.amount));

    let mut selected: Vec<ProofRecord> = Vec::new();
    let mut selected_sum = Amount::ZERO;

    loop {
        let fee = input_fee(selected.len(), fee_ppk);
        let needed_total = target.checked_add(fee)?;
        if selected_sum >= needed_total {
            selected.sort_by(|a, b| b.proof.amount.cmp(&a.proof.amount));
            return Ok(selected);
        }
        if rest.is_empty() {
            return Err(Error::InsufficientBalance);
        }

        let gap = needed_total - selected_sum;
        // Largest proof that fits in the gap; else everything left
        // overshoots and the smallest one wastes the least
        let position = rest
            .iter()
            .position(|r| r.proof.amount <= gap)
            .unwrap_or(rest.len() - 1);
        let picked = rest.remove(position);
        selected_sum += picked.proof.amount;
        selected.push(picked);
    }
}

/// Denominations for an amount: its power-of-two split
pub fn output_amounts(amount: Amount) -> Vec<Amount> {
    let mut amounts = amount.split();
    amounts.reverse();
    amounts
}

/// Match a NUT-9 restore response against the deterministic outputs it
/// was issued for, reconstructing the proofs the mint had signed.
///
/// The mint answers with the recognized subset only; outputs it never
/// signed are absent and tolerated.
pub fn match_restored(
    premints: &PreMintSecrets,
    response: &RestoreResponse,
    keys: &Keys,
) -> Result<Proofs, Error> {
    let mut proofs = Vec::with_capacity(response.signatures.len());
    for (output, signature) in response.outputs.iter().zip(&response.signatures) {
        let premint = premints
            .secrets
            .iter()
            .find(|p| p.blinded_message.blinded_secret == output.blinded_secret)
            .ok_or_else(|| {
                Error::Custom("restore returned an output outside the requested range".to_string())
            })?;
        let mint_key = keys
            .amount_key(signature.amount)
            .ok_or_else(|| Error::Custom("no mint key for restored amount".to_string()))?;
        let c = unblind_message(&signature.c, &premint.r, &mint_key)
            .map_err(|e| Error::Custom(e.to_string()))?;
        proofs.push(Proof {
            amount: signature.amount,
            keyset_id: signature.keyset_id,
            secret: premint.secret.clone(),
            c,
        });
    }
    Ok(proofs)
}
