//! Spark send engine

use std::sync::Arc;

use agicash_common::database::Database;
use agicash_common::records::{SparkSendQuote, SparkSendQuoteState};
use agicash_common::util::unix_time;
use agicash_common::{Account, Amount, Currency, Error, Money};
use tracing::instrument;
use uuid::Uuid;

use crate::invoice;
use crate::retry::with_retry;
use crate::spark::{SparkPaymentStatus, SparkRegistry};

/// Spark send engine
#[derive(Debug, Clone)]
pub struct SparkSendService {
    db: Arc<dyn Database>,
    sparks: Arc<SparkRegistry>,
}

impl SparkSendService {
    /// New service
    pub fn new(db: Arc<dyn Database>, sparks: Arc<SparkRegistry>) -> Self {
        Self { db, sparks }
    }

    /// Create a send quote in UNPAID
    #[instrument(skip(self, account, payment_request), fields(account_id = %account.id))]
    pub async fn create_send_quote(
        &self,
        account: &Account,
        payment_request: &str,
    ) -> Result<SparkSendQuote, Error> {
        if account.currency != Currency::Btc {
            return Err(Error::WrongAccountKind("BTC spark"));
        }
        account.spark_details()?;

        let amount = invoice::amount_sats(payment_request)?;
        // One percent, at least one sat, as the routing fee ceiling
        let estimated_fee = Amount::from((amount.value() / 100).max(1));

        let quote = SparkSendQuote::new(
            account.user_id.clone(),
            account.id,
            payment_request.to_string(),
            invoice::payment_hash(payment_request)?,
            Money::new(amount, Currency::Btc),
            estimated_fee,
            unix_time() + 600,
        );
        self.db.create_spark_send_quote(quote).await
    }

    /// UNPAID → PENDING: initiate the payment through Spark
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    pub async fn mark_as_pending(&self, quote_id: Uuid) -> Result<SparkSendQuote, Error> {
        let quote = self.quote(quote_id).await?;
        if !matches!(quote.state, SparkSendQuoteState::Unpaid) {
            return Ok(quote);
        }
        let account = self.account(quote.account_id).await?;
        let details = account.spark_details()?;
        let connector = self.sparks.connector(details.network).await?;

        let payment = connector
            .pay_invoice(&quote.payment_request, quote.estimated_fee)
            .await?;

        self.db
            .mark_spark_send_quote_as_pending(quote.id, quote.version, payment.id)
            .await
    }

    /// PENDING → COMPLETED | FAILED based on the payment outcome
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    pub async fn complete(&self, quote_id: Uuid) -> Result<SparkSendQuote, Error> {
        let quote = self.quote(quote_id).await?;
        let spark_id = match &quote.state {
            SparkSendQuoteState::Pending { spark_id } => spark_id.clone(),
            _ => return Ok(quote),
        };

        let account = self.account(quote.account_id).await?;
        let details = account.spark_details()?;
        let connector = self.sparks.connector(details.network).await?;

        let payment = connector.get_payment(&spark_id).await?;
        match payment.status {
            SparkPaymentStatus::Pending => Ok(quote),
            SparkPaymentStatus::Completed => {
                let preimage = payment.payment_preimage.ok_or_else(|| {
                    Error::Custom("completed payment without preimage".to_string())
                })?;
                self.db
                    .complete_spark_send_quote(quote.id, quote.version, payment.fee_sats, preimage)
                    .await
            }
            SparkPaymentStatus::Failed => {
                self.db
                    .fail_spark_send_quote(
                        quote.id,
                        quote.version,
                        "spark payment failed".to_string(),
                    )
                    .await
            }
        }
    }

    /// Drive one step of an unresolved quote
    #[instrument(skip(self, quote), fields(quote_id = %quote.id, state = quote.state_tag()))]
    pub async fn drive(&self, quote: SparkSendQuote) -> Result<SparkSendQuote, Error> {
        match &quote.state {
            SparkSendQuoteState::Unpaid => {
                if quote.is_expired(unix_time()) {
                    return self.expire(quote.id).await;
                }
                let quote = self.mark_as_pending(quote.id).await?;
                self.complete(quote.id).await
            }
            SparkSendQuoteState::Pending { .. } => self.complete(quote.id).await,
            _ => Ok(quote),
        }
    }

    /// UNPAID → EXPIRED
    pub async fn expire(&self, quote_id: Uuid) -> Result<SparkSendQuote, Error> {
        with_retry(|| async {
            let quote = self.quote(quote_id).await?;
            if quote.is_terminal() {
                return Ok(quote);
            }
            self.db
                .expire_spark_send_quote(quote.id, quote.version)
                .await
        })
        .await
    }

    async fn quote(&self, quote_id: Uuid) -> Result<SparkSendQuote, Error> {
        self.db
            .get_spark_send_quote(quote_id)
            .await?
            .ok_or_else(|| Error::NotFound("spark send quote", quote_id.to_string()))
    }

    async fn account(&self, account_id: Uuid) -> Result<Account, Error> {
        self.db
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound("account", account_id.to_string()))
    }
}
