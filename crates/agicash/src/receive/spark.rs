//! Spark receive engine
//!
//! Spark reports a settled receive in one step (preimage and transfer
//! id together), so the record completes straight from UNPAID.

use std::sync::Arc;
use std::time::Duration;

use agicash_common::database::Database;
use agicash_common::mint::{MeltQuoteRequest, MeltQuoteState, MeltRequest};
use agicash_common::records::{
    ReceiveKind, SparkReceiveQuote, SparkReceiveQuoteState, TokenReceiveData,
};
use agicash_common::util::unix_time;
use agicash_common::{Account, Amount, Currency, Error, Money, Token};
use tracing::instrument;
use uuid::Uuid;

use crate::fees::proofs_fee;
use crate::retry::with_retry;
use crate::spark::{SparkReceiveStatus, SparkRegistry};
use crate::MintRegistry;

/// Ceiling for the one-shot interactive wait on a spark payment
const INTERACTIVE_WAIT_CEILING: Duration = Duration::from_secs(10);
const INTERACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Spark receive engine
#[derive(Debug, Clone)]
pub struct SparkReceiveService {
    db: Arc<dyn Database>,
    sparks: Arc<SparkRegistry>,
    mints: Arc<MintRegistry>,
}

impl SparkReceiveService {
    /// New service
    pub fn new(
        db: Arc<dyn Database>,
        sparks: Arc<SparkRegistry>,
        mints: Arc<MintRegistry>,
    ) -> Self {
        Self { db, sparks, mints }
    }

    /// Create a Lightning receive quote in UNPAID
    #[instrument(skip(self, account), fields(account_id = %account.id))]
    pub async fn create_receive_quote(
        &self,
        account: &Account,
        amount: Money,
        description: Option<String>,
    ) -> Result<SparkReceiveQuote, Error> {
        if account.currency != Currency::Btc || amount.currency != Currency::Btc {
            return Err(Error::CurrencyMismatch(account.currency, amount.currency));
        }
        let details = account.spark_details()?;
        let connector = self.sparks.connector(details.network).await?;

        let request = connector
            .create_lightning_invoice(amount.amount, description.clone(), None)
            .await?;

        let quote = SparkReceiveQuote {
            id: Uuid::new_v4(),
            user_id: account.user_id.clone(),
            account_id: account.id,
            transaction_id: Uuid::new_v4(),
            spark_id: request.id,
            amount,
            description,
            payment_request: request.payment_request,
            payment_hash: request.payment_hash,
            receiver_identity_pubkey: Some(details.identity_pubkey),
            created_at: unix_time(),
            expires_at: request.expires_at,
            version: 0,
            kind: ReceiveKind::Lightning,
            state: SparkReceiveQuoteState::Unpaid,
        };
        self.db.create_spark_receive_quote(quote).await
    }

    /// Create a cross-mint receive paying a spark invoice by melting a
    /// token from a cashu mint.
    #[instrument(skip(self, account, token), fields(account_id = %account.id))]
    pub async fn create_token_receive_quote(
        &self,
        account: &Account,
        token: &Token,
    ) -> Result<SparkReceiveQuote, Error> {
        let details = account.spark_details()?;
        let connector = self.sparks.connector(details.network).await?;

        let source = self.mints.service(token.mint_url()).await?;
        source.require_online()?;

        let token_proofs = token.proofs();
        let token_amount = token.value();
        let melt_input_fee = proofs_fee(&source, &token_proofs)?;
        let reserve_estimate = Amount::from((token_amount.value() / 100).max(1));
        let receive_amount = token_amount
            .checked_sub(melt_input_fee)
            .and_then(|a| a.checked_sub(reserve_estimate))
            .map_err(|_| Error::Custom("token too small to bridge".to_string()))?;

        let request = connector
            .create_lightning_invoice(receive_amount, None, None)
            .await?;

        let melt_quote = source
            .connector()
            .create_melt_quote(MeltQuoteRequest {
                request: request.payment_request.clone(),
                unit: token.unit(),
            })
            .await?;

        let quote = SparkReceiveQuote {
            id: Uuid::new_v4(),
            user_id: account.user_id.clone(),
            account_id: account.id,
            transaction_id: Uuid::new_v4(),
            spark_id: request.id,
            amount: Money::new(receive_amount, Currency::Btc),
            description: None,
            payment_request: request.payment_request,
            payment_hash: request.payment_hash,
            receiver_identity_pubkey: Some(details.identity_pubkey),
            created_at: unix_time(),
            expires_at: request.expires_at.min(melt_quote.expiry),
            version: 0,
            kind: ReceiveKind::CashuToken(TokenReceiveData {
                source_mint_url: token.mint_url().clone(),
                token_proofs,
                melt_quote_id: melt_quote.quote,
                melt_quote_expiry: melt_quote.expiry,
                melt_initiated: false,
                cashu_receive_fee: melt_input_fee,
                lightning_fee_reserve: melt_quote.fee_reserve,
            }),
            state: SparkReceiveQuoteState::Unpaid,
        };
        self.db.create_spark_receive_quote(quote).await
    }

    /// Drive one step of an unresolved quote
    #[instrument(skip(self, quote), fields(quote_id = %quote.id, state = quote.state_tag()))]
    pub async fn drive(&self, quote: SparkReceiveQuote) -> Result<SparkReceiveQuote, Error> {
        if !matches!(quote.state, SparkReceiveQuoteState::Unpaid) {
            return Ok(quote);
        }
        if quote.is_expired(unix_time()) {
            return self.expire(quote.id).await;
        }

        if let ReceiveKind::CashuToken(data) = &quote.kind {
            if let Some(updated) = self.drive_melt_bridge(&quote, data).await? {
                return Ok(updated);
            }
        }

        let account = self.account(quote.account_id).await?;
        let details = account.spark_details()?;
        let connector = self.sparks.connector(details.network).await?;
        let request = connector
            .get_lightning_receive_request(&quote.spark_id)
            .await?;

        match request.status {
            SparkReceiveStatus::Unpaid => Ok(quote),
            SparkReceiveStatus::TransferCompleted => {
                let preimage = request
                    .payment_preimage
                    .ok_or_else(|| Error::Custom("completed transfer without preimage".to_string()))?;
                let transfer_id = request
                    .transfer_id
                    .ok_or_else(|| Error::Custom("completed transfer without id".to_string()))?;
                self.complete(quote.id, preimage, transfer_id).await
            }
            SparkReceiveStatus::TransferFailed => self.fail(quote.id, "spark transfer failed").await,
            SparkReceiveStatus::Expired => self.expire(quote.id).await,
        }
    }

    async fn drive_melt_bridge(
        &self,
        quote: &SparkReceiveQuote,
        data: &TokenReceiveData,
    ) -> Result<Option<SparkReceiveQuote>, Error> {
        let source = self.mints.service(&data.source_mint_url).await?;
        source.require_online()?;

        if !data.melt_initiated {
            let quote = self
                .db
                .mark_spark_receive_quote_melt_initiated(quote.id, quote.version)
                .await?;
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
            MeltQuoteState::Unpaid | MeltQuoteState::Failed => self
                .fail(quote.id, "melt of source-mint proofs failed")
                .await
                .map(Some),
            MeltQuoteState::Pending | MeltQuoteState::Unknown | MeltQuoteState::Paid => Ok(None),
        }
    }

    /// One-shot wait for an interactive claim, polling under a hard
    /// 10 second ceiling. Returns the latest state either way.
    pub async fn wait_for_payment(
        &self,
        quote_id: Uuid,
        budget: Duration,
    ) -> Result<SparkReceiveQuote, Error> {
        let budget = budget.min(INTERACTIVE_WAIT_CEILING);
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let quote = self
                .db
                .get_spark_receive_quote(quote_id)
                .await?
                .ok_or_else(|| Error::NotFound("spark receive quote", quote_id.to_string()))?;
            let quote = self.drive(quote).await?;
            if quote.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(quote);
            }
            tokio::time::sleep_until(
                (tokio::time::Instant::now() + INTERACTIVE_POLL_INTERVAL).min(deadline),
            )
            .await;
        }
    }

    /// UNPAID → COMPLETED
    pub async fn complete(
        &self,
        quote_id: Uuid,
        payment_preimage: String,
        spark_transfer_id: String,
    ) -> Result<SparkReceiveQuote, Error> {
        with_retry(|| {
            let preimage = payment_preimage.clone();
            let transfer_id = spark_transfer_id.clone();
            async move {
                let quote = self
                    .db
                    .get_spark_receive_quote(quote_id)
                    .await?
                    .ok_or_else(|| Error::NotFound("spark receive quote", quote_id.to_string()))?;
                if quote.is_terminal() {
                    return Ok(quote);
                }
                self.db
                    .complete_spark_receive_quote(quote.id, quote.version, preimage, transfer_id)
                    .await
            }
        })
        .await
    }

    /// UNPAID → EXPIRED
    pub async fn expire(&self, quote_id: Uuid) -> Result<SparkReceiveQuote, Error> {
        with_retry(|| async {
            let quote = self
                .db
                .get_spark_receive_quote(quote_id)
                .await?
                .ok_or_else(|| Error::NotFound("spark receive quote", quote_id.to_string()))?;
            if quote.is_terminal() {
                return Ok(quote);
            }
            self.db
                .expire_spark_receive_quote(quote.id, quote.version)
                .await
        })
        .await
    }

    /// UNPAID → FAILED
    pub async fn fail(
        &self,
        quote_id: Uuid,
        reason: impl Into<String> + Clone + Send,
    ) -> Result<SparkReceiveQuote, Error> {
        with_retry(|| {
            let reason = reason.clone();
            async move {
                let quote = self
                    .db
                    .get_spark_receive_quote(quote_id)
                    .await?
                    .ok_or_else(|| Error::NotFound("spark receive quote", quote_id.to_string()))?;
                if quote.is_terminal() {
                    return Ok(quote);
                }
                self.db
                    .fail_spark_receive_quote(quote.id, quote.version, reason.into())
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
