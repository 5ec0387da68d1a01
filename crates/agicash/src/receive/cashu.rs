//! Cashu receive engine
//!
//! Runs the locked mint-quote lifecycle: quote creation, payment
//! detection, deterministic minting with NUT-9 restore recovery, and
//! the cross-mint melt→mint bridge for incoming tokens from other
//! mints.

use std::sync::Arc;

use agicash_common::database::Database;
use agicash_common::dhke::{construct_proofs, verify_dleq};
use agicash_common::mint::{
    MeltQuoteRequest, MeltQuoteState, MeltRequest, MintQuoteRequest, MintQuoteState, MintRequest,
    RestoreRequest,
};
use agicash_common::outputs::{derive_locking_key, sign_mint_request, PreMintSecrets};
use agicash_common::proof::Proofs;
use agicash_common::records::{
    CashuReceiveQuote, CashuReceiveQuoteState, MintedOutputs, ReceiveKind, TokenReceiveData,
};
use agicash_common::util::{hex, unix_time};
use agicash_common::{Account, Amount, Error, Money, Token};
use tracing::instrument;
use uuid::Uuid;

use crate::fees::proofs_fee;
use crate::invoice;
use crate::ledger::{match_restored, output_amounts};
use crate::mint::{MintRegistry, MintService};
use crate::retry::with_retry;
use crate::WalletKeys;

/// A locked mint quote before any record exists; obtaining it has no
/// durable effect besides advancing the locking index.
#[derive(Debug, Clone)]
pub struct LightningQuote {
    /// Mint-side quote id
    pub quote_id: String,
    /// bolt11 payment request
    pub payment_request: String,
    /// Payment hash of the invoice, hex
    pub payment_hash: String,
    /// Expiry, unix seconds
    pub expires_at: u64,
    /// Fee charged by the mint for minting, when advertised
    pub minting_fee: Option<Amount>,
    /// Locking key index used for this quote
    pub locking_index: u32,
    /// Full derivation path of the locking key
    pub locking_derivation_path: String,
}

/// Cashu receive engine
#[derive(Debug, Clone)]
pub struct CashuReceiveService {
    db: Arc<dyn Database>,
    mints: Arc<MintRegistry>,
    keys: WalletKeys,
}

impl CashuReceiveService {
    /// New service
    pub fn new(db: Arc<dyn Database>, mints: Arc<MintRegistry>, keys: WalletKeys) -> Self {
        Self { db, mints, keys }
    }

    async fn mint_service(&self, account: &Account) -> Result<Arc<MintService>, Error> {
        let details = account.cashu_details()?;
        self.mints.service(&details.mint_url).await
    }

    /// Ask the mint for a quote locked to the next derived key.
    ///
    /// External side-effect only; no record is created yet.
    #[instrument(skip(self, account), fields(account_id = %account.id))]
    pub async fn get_lightning_quote(
        &self,
        account: &Account,
        amount: Money,
        description: Option<String>,
    ) -> Result<LightningQuote, Error> {
        if amount.currency != account.currency {
            return Err(Error::CurrencyMismatch(account.currency, amount.currency));
        }
        let service = self.mint_service(account).await?;
        service.require_online()?;

        let locking_index = self.db.increment_locking_counter(&account.user_id).await?;
        let locking = derive_locking_key(self.keys.seed(), locking_index)
            .map_err(|e| Error::Custom(e.to_string()))?;

        let response = service
            .connector()
            .create_mint_quote(MintQuoteRequest {
                amount: amount.amount,
                unit: account.unit(),
                description,
                pubkey: Some(locking.public_key),
            })
            .await?;

        Ok(LightningQuote {
            payment_hash: invoice::payment_hash(&response.request)?,
            quote_id: response.quote,
            payment_request: response.request,
            expires_at: response.expiry,
            minting_fee: None,
            locking_index,
            locking_derivation_path: locking.derivation_path.to_string(),
        })
    }

    /// Create a Lightning receive quote in UNPAID
    #[instrument(skip(self, account), fields(account_id = %account.id))]
    pub async fn create_receive_quote(
        &self,
        account: &Account,
        amount: Money,
        description: Option<String>,
    ) -> Result<CashuReceiveQuote, Error> {
        let lightning = self
            .get_lightning_quote(account, amount, description.clone())
            .await?;
        let quote = CashuReceiveQuote::new(
            account.user_id.clone(),
            account.id,
            lightning.quote_id,
            amount,
            description,
            lightning.payment_request,
            lightning.payment_hash,
            lightning.locking_derivation_path,
            lightning.locking_index,
            lightning.minting_fee,
            lightning.expires_at,
            ReceiveKind::Lightning,
        );
        self.db.create_cashu_receive_quote(quote).await
    }

    /// Create a cross-mint receive for a token issued by another mint.
    ///
    /// Issues a locked invoice on the receiving account's mint sized to
    /// the token value minus the melt input fee and the Lightning fee
    /// reserve, then quotes the melt of the token's proofs on their own
    /// mint. The record expires at the earlier of the two quotes.
    #[instrument(skip(self, account, token), fields(account_id = %account.id))]
    pub async fn create_token_receive_quote(
        &self,
        account: &Account,
        token: &Token,
    ) -> Result<CashuReceiveQuote, Error> {
        let details = account.cashu_details()?;
        if token.mint_url() == &details.mint_url {
            return Err(Error::Custom(
                "same-mint token belongs in a token swap, not a cross-mint receive".to_string(),
            ));
        }

        let source = self.mints.service(token.mint_url()).await?;
        source.require_online()?;

        let token_proofs = token.proofs();
        let token_amount = token.value();
        let melt_input_fee = proofs_fee(&source, &token_proofs)?;

        // Reserve roughly one percent for the Lightning hop; the exact
        // reserve comes back with the melt quote
        let reserve_estimate = Amount::from((token_amount.value() / 100).max(1));
        let receive_amount = token_amount
            .checked_sub(melt_input_fee)
            .and_then(|a| a.checked_sub(reserve_estimate))
            .map_err(|_| Error::Custom("token too small to bridge".to_string()))?;

        let lightning = self
            .get_lightning_quote(account, Money::new(receive_amount, account.currency), None)
            .await?;

        let melt_quote = source
            .connector()
            .create_melt_quote(MeltQuoteRequest {
                request: lightning.payment_request.clone(),
                unit: token.unit(),
            })
            .await?;

        let total_needed = melt_quote
            .amount
            .checked_add(melt_quote.fee_reserve)?
            .checked_add(melt_input_fee)?;
        if total_needed > token_amount {
            return Err(Error::Custom(format!(
                "token value {token_amount} cannot cover melt of {total_needed}"
            )));
        }

        let data = TokenReceiveData {
            source_mint_url: token.mint_url().clone(),
            token_proofs,
            melt_quote_id: melt_quote.quote,
            melt_quote_expiry: melt_quote.expiry,
            melt_initiated: false,
            cashu_receive_fee: melt_input_fee,
            lightning_fee_reserve: melt_quote.fee_reserve,
        };

        let quote = CashuReceiveQuote::new(
            account.user_id.clone(),
            account.id,
            lightning.quote_id,
            Money::new(receive_amount, account.currency),
            None,
            lightning.payment_request,
            lightning.payment_hash,
            lightning.locking_derivation_path,
            lightning.locking_index,
            lightning.minting_fee,
            lightning.expires_at.min(melt_quote.expiry),
            ReceiveKind::CashuToken(data),
        );
        self.db.create_cashu_receive_quote(quote).await
    }

    /// UNPAID → PAID: allocate the deterministic output range.
    ///
    /// Idempotent: a quote that is already past UNPAID is returned
    /// unchanged.
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    pub async fn process_payment(&self, quote_id: Uuid) -> Result<CashuReceiveQuote, Error> {
        with_retry(|| async {
            let quote = self
                .db
                .get_cashu_receive_quote(quote_id)
                .await?
                .ok_or_else(|| Error::NotFound("cashu receive quote", quote_id.to_string()))?;
            if !matches!(quote.state, CashuReceiveQuoteState::Unpaid) {
                return Ok(quote);
            }
            let account = self.account(quote.account_id).await?;
            let service = self.mint_service(&account).await?;
            let keyset = service.active_keyset(account.unit())?;
            let outputs = MintedOutputs {
                keyset_id: keyset.id,
                keyset_counter: account.keyset_counter(&keyset.id),
                output_amounts: output_amounts(quote.amount.amount),
            };
            self.db
                .process_cashu_receive_quote_payment(quote.id, quote.version, outputs)
                .await
        })
        .await
    }

    /// PAID → COMPLETED: mint against the recorded output range and
    /// insert the proofs.
    ///
    /// A crash after the mint signed is recovered by NUT-9 restore over
    /// the same range; re-invocation on a COMPLETED quote is a no-op.
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    pub async fn complete_receive(&self, quote_id: Uuid) -> Result<CashuReceiveQuote, Error> {
        with_retry(|| async {
            let quote = self
                .db
                .get_cashu_receive_quote(quote_id)
                .await?
                .ok_or_else(|| Error::NotFound("cashu receive quote", quote_id.to_string()))?;
            let outputs = match &quote.state {
                CashuReceiveQuoteState::Paid(outputs) => outputs.clone(),
                CashuReceiveQuoteState::Completed(_) => return Ok(quote),
                _ => {
                    return Err(Error::InvalidStateTransition {
                        record: "cashu receive quote",
                        detail: format!("complete_receive from {}", quote.state_tag()),
                    })
                }
            };

            let account = self.account(quote.account_id).await?;
            let service = self.mint_service(&account).await?;
            let proofs = self.mint_or_restore(&service, &quote, &outputs).await?;
            let records = crate::ledger::ProofLedger::records_for(&account, proofs)?;

            match self
                .db
                .complete_cashu_receive_quote(quote.id, quote.version, records)
                .await
            {
                // A racing driver inserted the proofs first; the quote
                // will read COMPLETED on the retry pass
                Err(Error::DuplicateProof(_)) => Err(Error::Concurrency {
                    record: "cashu receive quote",
                    id: quote.id.to_string(),
                }),
                other => other,
            }
        })
        .await
    }

    /// Derive the recorded outputs, request signatures, and fall back
    /// to restore when the mint reports the work as already done.
    async fn mint_or_restore(
        &self,
        service: &MintService,
        quote: &CashuReceiveQuote,
        outputs: &MintedOutputs,
    ) -> Result<Proofs, Error> {
        let premints = PreMintSecrets::from_seed(
            self.keys.seed(),
            outputs.keyset_id,
            outputs.keyset_counter,
            &outputs.output_amounts,
        )
        .map_err(|e| Error::Custom(e.to_string()))?;
        let keys = service.keyset_keys(outputs.keyset_id).await?;

        let locking = derive_locking_key(self.keys.seed(), quote.locking_index)
            .map_err(|e| Error::Custom(e.to_string()))?;
        let signature = sign_mint_request(
            &locking.secret_key,
            &quote.quote_id,
            &premints.blinded_messages(),
        )
        .map_err(|e| Error::Custom(e.to_string()))?;

        let request = MintRequest {
            quote: quote.quote_id.clone(),
            outputs: premints.blinded_messages(),
            signature: Some(hex::encode(signature.serialize())),
        };

        match service.connector().mint_proofs(request).await {
            Ok(response) => {
                for (signature, premint) in response.signatures.iter().zip(&premints.secrets) {
                    if let Some(dleq) = &signature.dleq {
                        let mint_key = keys
                            .amount_key(signature.amount)
                            .ok_or_else(|| Error::Custom("no mint key for amount".to_string()))?;
                        let valid = verify_dleq(
                            &premint.blinded_message.blinded_secret,
                            &signature.c,
                            &dleq.e,
                            &dleq.s,
                            &mint_key,
                        )
                        .map_err(|e| Error::Custom(e.to_string()))?;
                        if !valid {
                            return Err(Error::Custom("mint returned invalid DLEQ".to_string()));
                        }
                    }
                }
                construct_proofs(
                    response.signatures,
                    premints.rs(),
                    premints.secrets(),
                    &keys,
                )
                .map_err(|e| Error::Custom(e.to_string()))
            }
            Err(Error::MintOperation(err)) if err.code.is_recoverable_by_restore() => {
                tracing::warn!(quote_id = %quote.id, code = %err.code, "recovering via restore");
                let response = service
                    .connector()
                    .restore(RestoreRequest {
                        outputs: premints.blinded_messages(),
                    })
                    .await?;
                match_restored(&premints, &response, &keys)
            }
            Err(err) => Err(err),
        }
    }

    /// Drive one step of an unresolved quote: expiry, the cross-mint
    /// melt bridge, payment detection, completion.
    #[instrument(skip(self, quote), fields(quote_id = %quote.id, state = quote.state_tag()))]
    pub async fn drive(&self, quote: CashuReceiveQuote) -> Result<CashuReceiveQuote, Error> {
        match &quote.state {
            CashuReceiveQuoteState::Unpaid => {
                if quote.is_expired(unix_time()) {
                    return self.expire(quote.id).await;
                }
                if let ReceiveKind::CashuToken(data) = &quote.kind {
                    if let Some(updated) = self.drive_melt_bridge(&quote, data).await? {
                        return Ok(updated);
                    }
                }
                let account = self.account(quote.account_id).await?;
                let service = self.mint_service(&account).await?;
                let response = service.connector().check_mint_quote(&quote.quote_id).await?;
                match response.state {
                    MintQuoteState::Unpaid => Ok(quote),
                    MintQuoteState::Paid => {
                        let quote = self.process_payment(quote.id).await?;
                        self.complete_receive(quote.id).await
                    }
                    MintQuoteState::Issued => {
                        // Proofs can only have been issued with this
                        // wallet's signature over a recorded range;
                        // seeing ISSUED without one means the record
                        // was lost upstream
                        self.fail(quote.id, "quote already issued without a recorded allocation")
                            .await
                    }
                }
            }
            CashuReceiveQuoteState::Paid(_) => self.complete_receive(quote.id).await,
            _ => Ok(quote),
        }
    }

    /// Drive the melt half of a cross-mint receive. Returns the updated
    /// quote when the bridge changed it.
    async fn drive_melt_bridge(
        &self,
        quote: &CashuReceiveQuote,
        data: &TokenReceiveData,
    ) -> Result<Option<CashuReceiveQuote>, Error> {
        let source = self.mints.service(&data.source_mint_url).await?;
        source.require_online()?;

        if !data.melt_initiated {
            let quote = self
                .db
                .mark_cashu_receive_quote_melt_initiated(quote.id, quote.version)
                .await?;
            // Melt is idempotent by quote id, so a crash between the
            // latch and the call is re-driven safely
            let melt = source
                .connector()
                .melt_proofs(MeltRequest {
                    quote: data.melt_quote_id.clone(),
                    inputs: data.token_proofs.clone(),
                    outputs: None,
                })
                .await?;
            if melt.state == MeltQuoteState::Failed {
                return self
                    .fail(quote.id, "melt of source-mint proofs failed")
                    .await
                    .map(Some);
            }
            return Ok(Some(quote));
        }

        let melt = source
            .connector()
            .check_melt_quote(&data.melt_quote_id)
            .await?;
        match melt.state {
            // A melt that fell back to UNPAID after being driven means
            // the payment attempt failed
            MeltQuoteState::Unpaid | MeltQuoteState::Failed => self
                .fail(quote.id, "melt of source-mint proofs failed")
                .await
                .map(Some),
            MeltQuoteState::Pending | MeltQuoteState::Unknown => Ok(None),
            MeltQuoteState::Paid => Ok(None),
        }
    }

    /// UNPAID → EXPIRED
    pub async fn expire(&self, quote_id: Uuid) -> Result<CashuReceiveQuote, Error> {
        with_retry(|| async {
            let quote = self
                .db
                .get_cashu_receive_quote(quote_id)
                .await?
                .ok_or_else(|| Error::NotFound("cashu receive quote", quote_id.to_string()))?;
            if quote.is_terminal() {
                return Ok(quote);
            }
            self.db
                .expire_cashu_receive_quote(quote.id, quote.version)
                .await
        })
        .await
    }

    /// → FAILED with a reason
    pub async fn fail(
        &self,
        quote_id: Uuid,
        reason: impl Into<String> + Clone + Send,
    ) -> Result<CashuReceiveQuote, Error> {
        with_retry(|| {
            let reason = reason.clone();
            async move {
                let quote = self
                    .db
                    .get_cashu_receive_quote(quote_id)
                    .await?
                    .ok_or_else(|| Error::NotFound("cashu receive quote", quote_id.to_string()))?;
                if quote.is_terminal() {
                    return Ok(quote);
                }
                self.db
                    .fail_cashu_receive_quote(quote.id, quote.version, reason.into())
                    .await
            }
        })
        .await
    }

    async fn account(&self, account_id: Uuid) -> Result<Account, Error> {
        self.db
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound("account", account_id.to_string()))
    }
}
