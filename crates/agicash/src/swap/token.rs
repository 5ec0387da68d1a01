//! Token swap engine (same-mint receive)
//!
//! Swaps the proofs of an incoming token for freshly-issued proofs
//! under the receiver's deterministic secrets. The sha256 of the
//! encoded token keys the swap, so the same token can only ever be
//! claimed once.

use std::sync::Arc;

use agicash_common::database::Database;
use agicash_common::dhke::construct_proofs;
use agicash_common::mint::{RestoreRequest, SwapRequest};
use agicash_common::outputs::PreMintSecrets;
use agicash_common::proof::{Proofs, ProofsMethods};
use agicash_common::records::{CashuTokenSwap, CashuTokenSwapState};
use agicash_common::{Account, Error, Token};
use tracing::instrument;
use uuid::Uuid;

use crate::fees::proofs_fee;
use crate::ledger::{match_restored, output_amounts, ProofLedger};
use crate::mint::{MintRegistry, MintService};
use crate::retry::with_retry;
use crate::WalletKeys;

/// Token swap engine
#[derive(Debug, Clone)]
pub struct TokenSwapService {
    db: Arc<dyn Database>,
    mints: Arc<MintRegistry>,
    keys: WalletKeys,
}

impl TokenSwapService {
    /// New service
    pub fn new(db: Arc<dyn Database>, mints: Arc<MintRegistry>, keys: WalletKeys) -> Self {
        Self { db, mints, keys }
    }

    /// Create a swap in PENDING for an incoming same-mint token.
    ///
    /// A second claim of the same token fails with
    /// [`Error::TokenAlreadyClaimed`].
    #[instrument(skip(self, account, token), fields(account_id = %account.id))]
    pub async fn create_token_swap(
        &self,
        account: &Account,
        token: &Token,
    ) -> Result<CashuTokenSwap, Error> {
        let details = account.cashu_details()?;
        if token.mint_url() != &details.mint_url {
            return Err(Error::Custom(
                "token from another mint belongs in a cross-mint receive".to_string(),
            ));
        }
        if token.unit() != account.unit() {
            return Err(Error::Custom(format!(
                "token unit {} does not match account unit {}",
                token.unit(),
                account.unit()
            )));
        }

        let service = self.mints.service(&details.mint_url).await?;
        service.require_online()?;

        let token_hash = token.token_hash();
        let token_proofs = token.proofs();
        let input_amount = token_proofs.total_amount();
        let fee_amount = proofs_fee(&service, &token_proofs)?;
        let amount_received = input_amount.checked_sub(fee_amount)?;

        with_retry(|| async {
            let account = self
                .db
                .get_account(account.id)
                .await?
                .ok_or_else(|| Error::NotFound("account", account.id.to_string()))?;
            let keyset = service.active_keyset(account.unit())?;
            let swap = CashuTokenSwap::new(
                account.user_id.clone(),
                account.id,
                token_hash.clone(),
                token_proofs.clone(),
                input_amount,
                fee_amount,
                keyset.id,
                account.keyset_counter(&keyset.id),
                output_amounts(amount_received),
            )?;
            self.db.create_cashu_token_swap(swap).await
        })
        .await
    }

    /// PENDING → COMPLETED: swap with the mint and insert the new
    /// proofs. Crashes after the mint signed recover via restore over
    /// the recorded range.
    #[instrument(skip(self), fields(swap_id = %swap_id))]
    pub async fn complete_swap(&self, swap_id: Uuid) -> Result<CashuTokenSwap, Error> {
        with_retry(|| async {
            let swap = self.swap(swap_id).await?;
            match swap.state {
                CashuTokenSwapState::Pending => {}
                _ => return Ok(swap),
            }

            let account = self.account(swap.account_id).await?;
            let details = account.cashu_details()?;
            let service = self.mints.service(&details.mint_url).await?;

            let proofs = self.swap_or_restore(&service, &swap).await?;
            let records = ProofLedger::records_for(&account, proofs)?;

            match self
                .db
                .complete_cashu_token_swap(swap.id, swap.version, records)
                .await
            {
                Err(Error::DuplicateProof(_)) => Err(Error::Concurrency {
                    record: "cashu token swap",
                    id: swap.id.to_string(),
                }),
                other => other,
            }
        })
        .await
    }

    async fn swap_or_restore(
        &self,
        service: &MintService,
        swap: &CashuTokenSwap,
    ) -> Result<Proofs, Error> {
        let premints = PreMintSecrets::from_seed(
            self.keys.seed(),
            swap.keyset_id,
            swap.keyset_counter,
            &swap.output_amounts,
        )
        .map_err(|e| Error::Custom(e.to_string()))?;
        let keys = service.keyset_keys(swap.keyset_id).await?;

        let request = SwapRequest {
            inputs: swap.token_proofs.clone(),
            outputs: premints.blinded_messages(),
        };

        match service.connector().swap(request).await {
            Ok(response) => construct_proofs(
                response.signatures,
                premints.rs(),
                premints.secrets(),
                &keys,
            )
            .map_err(|e| Error::Custom(e.to_string())),
            Err(Error::MintOperation(err)) if err.code.is_recoverable_by_restore() => {
                tracing::warn!(swap_id = %swap.id, code = %err.code, "recovering via restore");
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

    /// Interactive claim: create the swap, then complete best-effort.
    ///
    /// Once the swap record exists the token is safely claimed (the
    /// hash is taken); a completion failure is left to the background
    /// processor rather than failing the user's flow.
    #[instrument(skip(self, account, token), fields(account_id = %account.id))]
    pub async fn claim_token(
        &self,
        account: &Account,
        token: &Token,
    ) -> Result<CashuTokenSwap, Error> {
        let swap = self.create_token_swap(account, token).await?;
        match self.complete_swap(swap.id).await {
            Ok(swap) => Ok(swap),
            Err(err) => {
                tracing::warn!(swap_id = %swap.id, "claim completion deferred: {err}");
                Ok(swap)
            }
        }
    }

    /// Drive one step of an unresolved swap
    pub async fn drive(&self, swap: CashuTokenSwap) -> Result<CashuTokenSwap, Error> {
        match swap.state {
            CashuTokenSwapState::Pending => self.complete_swap(swap.id).await,
            _ => Ok(swap),
        }
    }

    /// PENDING → FAILED
    pub async fn fail(
        &self,
        swap_id: Uuid,
        reason: impl Into<String> + Clone + Send,
    ) -> Result<CashuTokenSwap, Error> {
        with_retry(|| {
            let reason = reason.clone();
            async move {
                let swap = self.swap(swap_id).await?;
                if swap.is_terminal() {
                    return Ok(swap);
                }
                self.db
                    .fail_cashu_token_swap(swap.id, swap.version, reason.into())
                    .await
            }
        })
        .await
    }

    async fn swap(&self, swap_id: Uuid) -> Result<CashuTokenSwap, Error> {
        self.db
            .get_cashu_token_swap(swap_id)
            .await?
            .ok_or_else(|| Error::NotFound("cashu token swap", swap_id.to_string()))
    }

    async fn account(&self, account_id: Uuid) -> Result<Account, Error> {
        self.db
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound("account", account_id.to_string()))
    }
}
