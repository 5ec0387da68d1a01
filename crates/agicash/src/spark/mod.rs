//! Spark connector and registry
//!
//! Spark provides Lightning receive and send without running a node.
//! The SDK itself is an external collaborator; this module defines the
//! typed seam the engines drive and the per-network registry with
//! single-flight initialisation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use agicash_common::account::SparkNetwork;
use agicash_common::proof::PublicKey;
use agicash_common::{Amount, Error};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};

/// Status of a Lightning receive request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SparkReceiveStatus {
    /// Invoice not paid yet
    Unpaid,
    /// Transfer completed; preimage and transfer id available
    TransferCompleted,
    /// Transfer failed
    TransferFailed,
    /// Invoice expired
    Expired,
}

/// A Lightning receive request as Spark reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkLightningReceiveRequest {
    /// Request id
    pub id: String,
    /// Current status
    pub status: SparkReceiveStatus,
    /// bolt11 invoice to hand to the payer
    pub payment_request: String,
    /// Payment hash of the invoice, hex
    pub payment_hash: String,
    /// Amount of the invoice in sats
    pub amount_sats: Amount,
    /// Expiry of the invoice, unix seconds
    pub expires_at: u64,
    /// Preimage, present once the transfer completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_preimage: Option<String>,
    /// Spark transfer id, present once the transfer completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
}

/// Status of an outbound Spark payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SparkPaymentStatus {
    /// Payment in flight
    Pending,
    /// Payment settled
    Completed,
    /// Payment failed
    Failed,
}

/// An outbound payment as Spark reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkPayment {
    /// Payment id
    pub id: String,
    /// Current status
    pub status: SparkPaymentStatus,
    /// Fee paid in sats, final once completed
    pub fee_sats: Amount,
    /// Preimage, present once settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_preimage: Option<String>,
}

/// Typed surface of the Spark SDK operations the engines drive
#[async_trait]
pub trait SparkConnector: Debug + Send + Sync {
    /// Identity public key of the initialised wallet
    fn identity_public_key(&self) -> PublicKey;

    /// Create a Lightning invoice, optionally for another receiver's
    /// identity (used by lightning-address writers)
    async fn create_lightning_invoice(
        &self,
        amount_sats: Amount,
        description: Option<String>,
        receiver_identity_pubkey: Option<PublicKey>,
    ) -> Result<SparkLightningReceiveRequest, Error>;

    /// Current state of a receive request
    async fn get_lightning_receive_request(
        &self,
        id: &str,
    ) -> Result<SparkLightningReceiveRequest, Error>;

    /// Pay a bolt11 invoice
    async fn pay_invoice(
        &self,
        payment_request: &str,
        max_fee_sats: Amount,
    ) -> Result<SparkPayment, Error>;

    /// Current state of an outbound payment
    async fn get_payment(&self, id: &str) -> Result<SparkPayment, Error>;
}

/// Async factory initialising a connector for a network; the mnemonic
/// is owned by the factory closure.
pub type SparkConnectorFactory =
    Box<dyn Fn(SparkNetwork) -> BoxFuture<'static, Result<Arc<dyn SparkConnector>, Error>> + Send + Sync>;

/// One initialised connector per network, with single-flight
/// initialisation. One wallet mnemonic per registry; a different seed
/// is a different registry.
pub struct SparkRegistry {
    factory: SparkConnectorFactory,
    connectors: Mutex<HashMap<SparkNetwork, Arc<OnceCell<Arc<dyn SparkConnector>>>>>,
}

impl Debug for SparkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparkRegistry").finish_non_exhaustive()
    }
}

impl SparkRegistry {
    /// New registry over a connector factory
    pub fn new(factory: SparkConnectorFactory) -> Self {
        Self {
            factory,
            connectors: Mutex::new(HashMap::new()),
        }
    }

    /// The connector for a network, initialising it exactly once even
    /// under concurrent callers.
    pub async fn connector(&self, network: SparkNetwork) -> Result<Arc<dyn SparkConnector>, Error> {
        let cell = {
            let mut connectors = self.connectors.lock().await;
            connectors
                .entry(network)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_try_init(|| (self.factory)(network))
            .await
            .cloned()
    }
}
