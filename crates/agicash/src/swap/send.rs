//! Send swap engine (same-mint send)
//!
//! Produces a sendable sub-token of exactly the requested amount. When
//! the selected proofs already sum to it, the inputs become the token
//! with no mint round-trip; otherwise a draft records the output plan,
//! and the mint swap splits the inputs into the send set plus change.
//! Once proofs-to-send exist they are live bearer money: the swap can
//! only complete (recipient claimed) or reverse (sender reclaimed).

use std::sync::Arc;

use agicash_common::database::Database;
use agicash_common::dhke::construct_proofs;
use agicash_common::mint::{CheckStateRequest, CheckedProofState, RestoreRequest, SwapRequest};
use agicash_common::outputs::PreMintSecrets;
use agicash_common::proof::{Proof, ProofRecord, Proofs, ProofsMethods, PublicKey};
use agicash_common::records::{CashuSendSwap, CashuSendSwapState, SendOutputPlan};
use agicash_common::{Account, Amount, Error, Token};
use tracing::instrument;
use uuid::Uuid;

use crate::fees::{input_fee, proofs_fee};
use crate::ledger::{match_restored, output_amounts, select_proofs, ProofLedger};
use crate::mint::{MintRegistry, MintService};
use crate::retry::with_retry;
use crate::swap::TokenSwapService;
use crate::WalletKeys;

/// Send swap engine
#[derive(Debug, Clone)]
pub struct SendSwapService {
    db: Arc<dyn Database>,
    mints: Arc<MintRegistry>,
    ledger: ProofLedger,
    token_swaps: TokenSwapService,
    keys: WalletKeys,
}

impl SendSwapService {
    /// New service
    pub fn new(db: Arc<dyn Database>, mints: Arc<MintRegistry>, keys: WalletKeys) -> Self {
        let ledger = ProofLedger::new(db.clone());
        let token_swaps = TokenSwapService::new(db.clone(), mints.clone(), keys.clone());
        Self {
            db,
            mints,
            ledger,
            token_swaps,
            keys,
        }
    }

    /// Create a send swap for the requested amount.
    ///
    /// Returns the record and, on the exact path, the finished token.
    /// On the draft path the token comes out of
    /// [`Self::swap_for_proofs_to_send`].
    #[instrument(skip(self, account), fields(account_id = %account.id))]
    pub async fn create_send_swap(
        &self,
        account: &Account,
        amount_requested: Amount,
    ) -> Result<(CashuSendSwap, Option<Token>), Error> {
        let details = account.cashu_details()?;
        let service = self.mints.service(&details.mint_url).await?;
        service.require_online()?;

        let keyset = service.active_keyset(account.unit())?;
        let fee_ppk = keyset.input_fee_ppk;
        let keyset_id = keyset.id;

        let spendable = self.ledger.spendable_proofs(account.id).await?;
        let selected = select_proofs(spendable, amount_requested, fee_ppk)?;
        let input_proofs: Proofs = selected.iter().map(|r| r.proof.clone()).collect();
        let input_amount = input_proofs.total_amount();
        let input_proof_ys: Vec<PublicKey> = selected.iter().map(|r| r.y).collect();

        if input_amount == amount_requested {
            // Exact path: the inputs are the token, nothing to swap
            let token = Token::new(
                details.mint_url.clone(),
                account.unit(),
                input_proofs.clone(),
                None,
            );
            let swap = CashuSendSwap::new_exact(
                account.user_id.clone(),
                account.id,
                amount_requested,
                amount_requested,
                proofs_fee(&service, &input_proofs)?,
                input_proof_ys,
                input_amount,
                token.token_hash(),
            );
            let swap = self.db.create_cashu_send_swap(swap).await?;
            return Ok((swap, Some(token)));
        }

        let cashu_send_fee = proofs_fee(&service, &input_proofs)?;
        let change_amount = input_amount
            .checked_sub(amount_requested)?
            .checked_sub(cashu_send_fee)?;
        let send_output_amounts = output_amounts(amount_requested);
        let change_output_amounts = output_amounts(change_amount);
        let cashu_receive_fee = input_fee(send_output_amounts.len(), fee_ppk);

        let swap = with_retry(|| async {
            let account = self
                .db
                .get_account(account.id)
                .await?
                .ok_or_else(|| Error::NotFound("account", account.id.to_string()))?;
            let plan = SendOutputPlan {
                keyset_id,
                keyset_counter: account.keyset_counter(&keyset_id),
                send_output_amounts: send_output_amounts.clone(),
                change_output_amounts: change_output_amounts.clone(),
            };
            let swap = CashuSendSwap::new_draft(
                account.user_id.clone(),
                account.id,
                amount_requested,
                amount_requested,
                cashu_send_fee,
                cashu_receive_fee,
                input_proof_ys.clone(),
                input_amount,
                plan,
            );
            self.db.create_cashu_send_swap(swap).await
        })
        .await?;

        Ok((swap, None))
    }

    /// DRAFT → PENDING: swap the inputs at the mint into the send set
    /// plus change, commit both, and return the token.
    ///
    /// Re-invoked on a PENDING swap, rebuilds and returns the token
    /// without touching the mint.
    #[instrument(skip(self), fields(swap_id = %swap_id))]
    pub async fn swap_for_proofs_to_send(
        &self,
        swap_id: Uuid,
    ) -> Result<(CashuSendSwap, Token), Error> {
        let swap = self.swap(swap_id).await?;
        let plan = match &swap.state {
            CashuSendSwapState::Draft(plan) => plan.clone(),
            CashuSendSwapState::Pending {
                proofs_to_send_ys, ..
            } => {
                let token = self
                    .token_for(&swap, proofs_to_send_ys.clone())
                    .await?;
                return Ok((swap, token));
            }
            _ => {
                return Err(Error::InvalidStateTransition {
                    record: "cashu send swap",
                    detail: format!("swap_for_proofs_to_send from {}", swap.state_tag()),
                })
            }
        };

        let account = self.account(swap.account_id).await?;
        let details = account.cashu_details()?;
        let service = self.mints.service(&details.mint_url).await?;

        let (send_proofs, change_proofs) = self.swap_or_restore(&service, &swap, &plan).await?;

        let token = Token::new(
            details.mint_url.clone(),
            account.unit(),
            send_proofs.clone(),
            None,
        );
        let token_hash = token.token_hash();

        let send_records = ProofLedger::records_for(&account, send_proofs)?;
        let change_records = ProofLedger::records_for(&account, change_proofs)?;

        let swap = match self
            .db
            .commit_proofs_to_send(
                swap.id,
                swap.version,
                token_hash,
                change_records,
                send_records,
            )
            .await
        {
            // A racing driver committed first; re-read and return its
            // token
            Err(err) if err.is_retryable() || matches!(err, Error::DuplicateProof(_)) => {
                let swap = self.swap(swap_id).await?;
                match &swap.state {
                    CashuSendSwapState::Pending {
                        proofs_to_send_ys, ..
                    } => {
                        let token = self.token_for(&swap, proofs_to_send_ys.clone()).await?;
                        return Ok((swap, token));
                    }
                    _ => return Err(err),
                }
            }
            other => other?,
        };

        Ok((swap, token))
    }

    /// Swap at the mint, partitioning the response into send and
    /// change. Restore recovery partitions by matching the recovered
    /// secrets back to their position in the output plan.
    async fn swap_or_restore(
        &self,
        service: &MintService,
        swap: &CashuSendSwap,
        plan: &SendOutputPlan,
    ) -> Result<(Proofs, Proofs), Error> {
        let mut amounts = plan.send_output_amounts.clone();
        amounts.extend(plan.change_output_amounts.iter().copied());
        let premints = PreMintSecrets::from_seed(
            self.keys.seed(),
            plan.keyset_id,
            plan.keyset_counter,
            &amounts,
        )
        .map_err(|e| Error::Custom(e.to_string()))?;
        let keys = service.keyset_keys(plan.keyset_id).await?;

        let input_records = self.db.get_proofs_by_ys(&swap.input_proof_ys).await?;
        let inputs: Proofs = input_records.into_iter().map(|r| r.proof).collect();

        let proofs = match service
            .connector()
            .swap(SwapRequest {
                inputs,
                outputs: premints.blinded_messages(),
            })
            .await
        {
            Ok(response) => construct_proofs(
                response.signatures,
                premints.rs(),
                premints.secrets(),
                &keys,
            )
            .map_err(|e| Error::Custom(e.to_string()))?,
            Err(Error::MintOperation(err)) if err.code.is_recoverable_by_restore() => {
                tracing::warn!(swap_id = %swap.id, code = %err.code, "recovering via restore");
                let response = service
                    .connector()
                    .restore(RestoreRequest {
                        outputs: premints.blinded_messages(),
                    })
                    .await?;
                match_restored(&premints, &response, &keys)?
            }
            Err(err) => return Err(err),
        };

        let send_count = plan.send_output_amounts.len();
        let mut send_proofs: Proofs = Vec::with_capacity(send_count);
        let mut change_proofs: Proofs = Vec::new();
        for proof in proofs {
            let position = premints
                .secrets
                .iter()
                .position(|p| p.secret == proof.secret)
                .ok_or_else(|| {
                    Error::Custom("swapped proof outside the output plan".to_string())
                })?;
            if position < send_count {
                send_proofs.push(proof);
            } else {
                change_proofs.push(proof);
            }
        }

        if send_proofs.total_amount() != swap.amount_to_send {
            return Err(Error::Custom(format!(
                "send proofs sum to {}, expected {}",
                send_proofs.total_amount(),
                swap.amount_to_send
            )));
        }

        Ok((send_proofs, change_proofs))
    }

    /// PENDING → COMPLETED | REVERSED, by observing whether the
    /// committed proofs were claimed and by whom.
    #[instrument(skip(self), fields(swap_id = %swap_id))]
    pub async fn check_claim(&self, swap_id: Uuid) -> Result<CashuSendSwap, Error> {
        let swap = self.swap(swap_id).await?;
        let (token_hash, send_ys) = match &swap.state {
            CashuSendSwapState::Pending {
                token_hash,
                proofs_to_send_ys,
            } => (token_hash.clone(), proofs_to_send_ys.clone()),
            _ => return Ok(swap),
        };

        // A reclaim by the sender shows up as their own token swap
        // keyed by the same token
        if let Some(reclaim) = self
            .db
            .get_cashu_token_swap_by_token_hash(&swap.user_id, &token_hash)
            .await?
        {
            if !matches!(
                reclaim.state,
                agicash_common::records::CashuTokenSwapState::Failed { .. }
            ) {
                return self
                    .db
                    .reverse_cashu_send_swap(swap.id, swap.version)
                    .await;
            }
        }

        let account = self.account(swap.account_id).await?;
        let details = account.cashu_details()?;
        let service = self.mints.service(&details.mint_url).await?;
        let response = service
            .connector()
            .check_proof_states(CheckStateRequest { ys: send_ys })
            .await?;

        let all_spent = !response.states.is_empty()
            && response
                .states
                .iter()
                .all(|s| s.state == CheckedProofState::Spent);
        if all_spent {
            return self.db.complete_cashu_send_swap(swap.id, swap.version).await;
        }
        Ok(swap)
    }

    /// Reclaim a PENDING swap's token back into the sender's account
    /// through the receive-side token swap engine, then mark the swap
    /// REVERSED.
    #[instrument(skip(self), fields(swap_id = %swap_id))]
    pub async fn reverse(&self, swap_id: Uuid) -> Result<CashuSendSwap, Error> {
        let swap = self.swap(swap_id).await?;
        let send_ys = match &swap.state {
            CashuSendSwapState::Pending {
                proofs_to_send_ys, ..
            } => proofs_to_send_ys.clone(),
            _ => {
                return Err(Error::InvalidStateTransition {
                    record: "cashu send swap",
                    detail: format!("reverse from {}", swap.state_tag()),
                })
            }
        };

        let account = self.account(swap.account_id).await?;
        let token = self.token_for(&swap, send_ys).await?;

        self.token_swaps.claim_token(&account, &token).await?;

        with_retry(|| async {
            let swap = self.swap(swap_id).await?;
            match swap.state {
                CashuSendSwapState::Pending { .. } => {
                    self.db.reverse_cashu_send_swap(swap.id, swap.version).await
                }
                _ => Ok(swap),
            }
        })
        .await
    }

    /// Drive one step of an unresolved swap
    pub async fn drive(&self, swap: CashuSendSwap) -> Result<CashuSendSwap, Error> {
        match &swap.state {
            CashuSendSwapState::Draft(_) => {
                let (swap, _token) = self.swap_for_proofs_to_send(swap.id).await?;
                Ok(swap)
            }
            CashuSendSwapState::Pending { .. } => self.check_claim(swap.id).await,
            _ => Ok(swap),
        }
    }

    /// DRAFT → FAILED; inputs release
    pub async fn fail(
        &self,
        swap_id: Uuid,
        reason: impl Into<String> + Clone + Send,
    ) -> Result<CashuSendSwap, Error> {
        with_retry(|| {
            let reason = reason.clone();
            async move {
                let swap = self.swap(swap_id).await?;
                if swap.is_terminal() {
                    return Ok(swap);
                }
                self.db
                    .fail_cashu_send_swap(swap.id, swap.version, reason.into())
                    .await
            }
        })
        .await
    }

    /// Rebuild the token of a committed swap from its stored proofs
    async fn token_for(&self, swap: &CashuSendSwap, send_ys: Vec<PublicKey>) -> Result<Token, Error> {
        let account = self.account(swap.account_id).await?;
        let details = account.cashu_details()?;
        let records = self.db.get_proofs_by_ys(&send_ys).await?;
        let proofs: Vec<Proof> = records.into_iter().map(|r: ProofRecord| r.proof).collect();
        Ok(Token::new(
            details.mint_url.clone(),
            account.unit(),
            proofs,
            None,
        ))
    }

    async fn swap(&self, swap_id: Uuid) -> Result<CashuSendSwap, Error> {
        self.db
            .get_cashu_send_swap(swap_id)
            .await?
            .ok_or_else(|| Error::NotFound("cashu send swap", swap_id.to_string()))
    }

    async fn account(&self, account_id: Uuid) -> Result<Account, Error> {
        self.db
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound("account", account_id.to_string()))
    }
}
