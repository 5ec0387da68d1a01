//! Cashu send engine
//!
//! Pays a bolt11 invoice by melting reserved proofs. The melt call is
//! idempotent by quote id, so the PENDING state is always re-driven
//! with the same call: a crash before the first melt and a crash after
//! settlement both resolve on the next pass.

use std::sync::Arc;

use agicash_common::database::Database;
use agicash_common::dhke::construct_proofs;
use agicash_common::mint::{MeltQuoteRequest, MeltQuoteState, MeltRequest};
use agicash_common::outputs::PreMintSecrets;
use agicash_common::proof::{ProofsMethods, PublicKey};
use agicash_common::records::{CashuSendQuote, CashuSendQuoteState};
use agicash_common::util::unix_time;
use agicash_common::{Account, Amount, Error, Money};
use tracing::instrument;
use uuid::Uuid;

use crate::fees::proofs_fee;
use crate::invoice;
use crate::ledger::{select_proofs, ProofLedger};
use crate::mint::MintRegistry;
use crate::retry::with_retry;
use crate::WalletKeys;

/// Number of blinded change outputs needed to decompose any change up
/// to `potential`
fn change_output_count(potential: Amount) -> usize {
    (64 - potential.value().leading_zeros()).max(1) as usize
}

/// Cashu send engine
#[derive(Debug, Clone)]
pub struct CashuSendService {
    db: Arc<dyn Database>,
    mints: Arc<MintRegistry>,
    ledger: ProofLedger,
    keys: WalletKeys,
}

impl CashuSendService {
    /// New service
    pub fn new(db: Arc<dyn Database>, mints: Arc<MintRegistry>, keys: WalletKeys) -> Self {
        let ledger = ProofLedger::new(db.clone());
        Self {
            db,
            mints,
            ledger,
            keys,
        }
    }

    /// Create a send quote in UNPAID: quote the melt with the mint,
    /// select and reserve input proofs.
    #[instrument(skip(self, account, payment_request), fields(account_id = %account.id))]
    pub async fn create_send_quote(
        &self,
        account: &Account,
        payment_request: &str,
    ) -> Result<CashuSendQuote, Error> {
        let details = account.cashu_details()?;
        let service = self.mints.service(&details.mint_url).await?;
        service.require_online()?;

        let melt_quote = service
            .connector()
            .create_melt_quote(MeltQuoteRequest {
                request: payment_request.to_string(),
                unit: account.unit(),
            })
            .await?;

        let keyset = service.active_keyset(account.unit())?;
        let fee_ppk = keyset.input_fee_ppk;

        let target = melt_quote.amount.checked_add(melt_quote.fee_reserve)?;
        let spendable = self.ledger.spendable_proofs(account.id).await?;
        let selected = select_proofs(spendable, target, fee_ppk)?;

        let input_proofs: Vec<_> = selected.iter().map(|r| r.proof.clone()).collect();
        let input_amount = input_proofs.total_amount();
        let input_fee = proofs_fee(&service, &input_proofs)?;
        let input_proof_ys: Vec<PublicKey> = selected.iter().map(|r| r.y).collect();

        let quote = CashuSendQuote::new(
            account.user_id.clone(),
            account.id,
            melt_quote.quote,
            payment_request.to_string(),
            invoice::payment_hash(payment_request)?,
            Money::new(melt_quote.amount, account.currency),
            melt_quote.fee_reserve,
            melt_quote.fee_reserve.checked_add(input_fee)?,
            input_proof_ys,
            input_amount,
            melt_quote.expiry,
        );
        self.db.create_cashu_send_quote(quote).await
    }

    /// UNPAID → PENDING: commit the change output plan.
    ///
    /// Change amounts are unknown until settlement (they come out of
    /// the unused fee reserve), so the plan only fixes the blinded
    /// output count and counter range.
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    pub async fn mark_as_pending(&self, quote_id: Uuid) -> Result<CashuSendQuote, Error> {
        with_retry(|| async {
            let quote = self.quote(quote_id).await?;
            if !matches!(quote.state, CashuSendQuoteState::Unpaid) {
                return Ok(quote);
            }
            let account = self.account(quote.account_id).await?;
            let service = self.mint_service(&account).await?;
            let keyset = service.active_keyset(account.unit())?;

            let potential_change = quote
                .input_amount
                .checked_sub(quote.amount.amount)
                .unwrap_or(Amount::ZERO);
            let change_output_amounts =
                vec![Amount::ZERO; change_output_count(potential_change)];

            self.db
                .mark_cashu_send_quote_as_pending(
                    quote.id,
                    quote.version,
                    keyset.id,
                    account.keyset_counter(&keyset.id),
                    change_output_amounts,
                )
                .await
        })
        .await
    }

    /// PENDING → COMPLETED | FAILED: melt idempotently and settle.
    ///
    /// The settled payment and the consumed inputs commit in one
    /// storage transaction; there is no window in which the network
    /// considers the invoice paid while the proofs read UNSPENT.
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    pub async fn complete(&self, quote_id: Uuid) -> Result<CashuSendQuote, Error> {
        let quote = self.quote(quote_id).await?;
        let (keyset_id, keyset_counter, change_plan) = match &quote.state {
            CashuSendQuoteState::Pending {
                keyset_id,
                keyset_counter,
                change_output_amounts,
            } => (*keyset_id, *keyset_counter, change_output_amounts.clone()),
            _ => return Ok(quote),
        };

        let account = self.account(quote.account_id).await?;
        let service = self.mint_service(&account).await?;

        let input_records = self.db.get_proofs_by_ys(&quote.input_proof_ys).await?;
        let inputs = input_records.into_iter().map(|r| r.proof).collect();

        let premints = PreMintSecrets::from_seed(
            self.keys.seed(),
            keyset_id,
            keyset_counter,
            &change_plan,
        )
        .map_err(|e| Error::Custom(e.to_string()))?;

        let melt = service
            .connector()
            .melt_proofs(MeltRequest {
                quote: quote.quote_id.clone(),
                inputs,
                outputs: Some(premints.blinded_messages()),
            })
            .await?;

        match melt.state {
            MeltQuoteState::Paid => {
                let keys = service.keyset_keys(keyset_id).await?;
                let change_signatures = melt.change.unwrap_or_default();
                let change_count = change_signatures.len();
                let change_proofs = construct_proofs(
                    change_signatures,
                    premints.rs().into_iter().take(change_count).collect(),
                    premints.secrets().into_iter().take(change_count).collect(),
                    &keys,
                )
                .map_err(|e| Error::Custom(e.to_string()))?;
                let change_amount = change_proofs.total_amount();
                let fee = quote
                    .fee_reserve
                    .checked_sub(change_amount)
                    .unwrap_or(Amount::ZERO);
                let change_records = ProofLedger::records_for(&account, change_proofs)?;
                self.db
                    .complete_cashu_send_quote(
                        quote.id,
                        quote.version,
                        fee,
                        melt.payment_preimage,
                        change_records,
                    )
                    .await
            }
            MeltQuoteState::Pending | MeltQuoteState::Unknown => Ok(quote),
            // The mint definitively reports the payment as not made;
            // the inputs were not consumed and go back to UNSPENT
            MeltQuoteState::Unpaid | MeltQuoteState::Failed => {
                self.db
                    .fail_cashu_send_quote(
                        quote.id,
                        quote.version,
                        "lightning payment failed".to_string(),
                        true,
                    )
                    .await
            }
        }
    }

    /// Park a PENDING quote whose external outcome cannot be
    /// determined. Inputs stay PENDING_SPEND until an operator
    /// resolves them.
    pub async fn fail_ambiguous(
        &self,
        quote_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<CashuSendQuote, Error> {
        let quote = self.quote(quote_id).await?;
        self.db
            .fail_cashu_send_quote(quote.id, quote.version, reason.into(), false)
            .await
    }

    /// Operator resolution of a parked FAILED quote: release the
    /// inputs (payment did not happen) or consume them (it settled
    /// after all).
    pub async fn resolve_failed(
        &self,
        quote_id: Uuid,
        consume: bool,
    ) -> Result<CashuSendQuote, Error> {
        self.db
            .resolve_failed_cashu_send_quote_inputs(quote_id, consume)
            .await
    }

    /// Drive one step of an unresolved quote
    #[instrument(skip(self, quote), fields(quote_id = %quote.id, state = quote.state_tag()))]
    pub async fn drive(&self, quote: CashuSendQuote) -> Result<CashuSendQuote, Error> {
        match &quote.state {
            CashuSendQuoteState::Unpaid => {
                if quote.is_expired(unix_time()) {
                    return self.expire(quote.id).await;
                }
                let quote = self.mark_as_pending(quote.id).await?;
                self.complete(quote.id).await
            }
            CashuSendQuoteState::Pending { .. } => self.complete(quote.id).await,
            _ => Ok(quote),
        }
    }

    /// UNPAID → EXPIRED; inputs release
    pub async fn expire(&self, quote_id: Uuid) -> Result<CashuSendQuote, Error> {
        with_retry(|| async {
            let quote = self.quote(quote_id).await?;
            if quote.is_terminal() {
                return Ok(quote);
            }
            self.db
                .expire_cashu_send_quote(quote.id, quote.version)
                .await
        })
        .await
    }

    async fn quote(&self, quote_id: Uuid) -> Result<CashuSendQuote, Error> {
        self.db
            .get_cashu_send_quote(quote_id)
            .await?
            .ok_or_else(|| Error::NotFound("cashu send quote", quote_id.to_string()))
    }

    async fn account(&self, account_id: Uuid) -> Result<Account, Error> {
        self.db
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound("account", account_id.to_string()))
    }

    async fn mint_service(
        &self,
        account: &Account,
    ) -> Result<Arc<crate::mint::MintService>, Error> {
        let details = account.cashu_details()?;
        self.mints.service(&details.mint_url).await
    }
}
