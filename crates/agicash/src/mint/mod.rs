//! Mint connectors and the per-url registry

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use agicash_common::amount::CurrencyUnit;
use agicash_common::keyset::{Id, KeySet, KeySetInfo, Keys};
use agicash_common::mint::{
    CheckStateRequest, CheckStateResponse, MeltQuoteRequest, MeltQuoteResponse, MeltRequest,
    MintInfo, MintQuoteRequest, MintQuoteResponse, MintRequest, MintResponse, RestoreRequest,
    RestoreResponse, SwapRequest, SwapResponse,
};
use agicash_common::{Error, MintUrl};
use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

mod http;

pub use http::HttpMintConnector;

/// Budget for the info + keyset fetches during initialisation; past it
/// the wallet starts in offline mode for that mint.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed surface of the mint endpoints the engine drives
#[async_trait]
pub trait MintConnector: Debug + Send + Sync {
    /// Mint metadata
    async fn get_mint_info(&self) -> Result<MintInfo, Error>;

    /// Advertised keysets
    async fn get_keysets(&self) -> Result<Vec<KeySetInfo>, Error>;

    /// Keys of one keyset
    async fn get_keys(&self, keyset_id: Id) -> Result<KeySet, Error>;

    /// Create a mint quote, optionally locked to a pubkey
    async fn create_mint_quote(
        &self,
        request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error>;

    /// Re-check a mint quote
    async fn check_mint_quote(&self, quote_id: &str) -> Result<MintQuoteResponse, Error>;

    /// Request blind signatures for a paid quote
    async fn mint_proofs(&self, request: MintRequest) -> Result<MintResponse, Error>;

    /// Swap input proofs for new outputs
    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, Error>;

    /// Create a melt quote for a bolt11 invoice
    async fn create_melt_quote(
        &self,
        request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error>;

    /// Melt proofs to pay the quoted invoice.
    ///
    /// Idempotent on the mint side by quote id: repeating the call for
    /// a quote that is already in flight or settled returns its current
    /// state instead of double-paying.
    async fn melt_proofs(&self, request: MeltRequest) -> Result<MeltQuoteResponse, Error>;

    /// Re-check a melt quote
    async fn check_melt_quote(&self, quote_id: &str) -> Result<MeltQuoteResponse, Error>;

    /// Proof states by Y values
    async fn check_proof_states(
        &self,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error>;

    /// Re-issue signatures for already-signed outputs
    async fn restore(&self, request: RestoreRequest) -> Result<RestoreResponse, Error>;
}

/// A mint connector together with the cached keyset material needed to
/// plan outputs and fees.
#[derive(Debug)]
pub struct MintService {
    mint_url: MintUrl,
    connector: Arc<dyn MintConnector>,
    info: Option<MintInfo>,
    keysets: Vec<KeySetInfo>,
    keys: Mutex<HashMap<Id, Keys>>,
    offline: bool,
}

impl MintService {
    /// Initialise against the mint, degrading to offline mode when the
    /// info and keyset fetches exceed the 10 second budget.
    pub async fn initialize(mint_url: MintUrl, connector: Arc<dyn MintConnector>) -> Self {
        let fetch = async {
            let info = connector.get_mint_info().await?;
            let keysets = connector.get_keysets().await?;
            Ok::<_, Error>((info, keysets))
        };

        match tokio::time::timeout(INIT_TIMEOUT, fetch).await {
            Ok(Ok((info, keysets))) => Self {
                mint_url,
                connector,
                info: Some(info),
                keysets,
                keys: Mutex::new(HashMap::new()),
                offline: false,
            },
            Ok(Err(err)) => {
                tracing::warn!(mint_url = %mint_url, "mint initialisation failed: {err}");
                Self::offline(mint_url, connector)
            }
            Err(_) => {
                tracing::warn!(mint_url = %mint_url, "mint initialisation timed out");
                Self::offline(mint_url, connector)
            }
        }
    }

    fn offline(mint_url: MintUrl, connector: Arc<dyn MintConnector>) -> Self {
        Self {
            mint_url,
            connector,
            info: None,
            keysets: Vec::new(),
            keys: Mutex::new(HashMap::new()),
            offline: true,
        }
    }

    /// Url of the mint this service talks to
    pub fn mint_url(&self) -> &MintUrl {
        &self.mint_url
    }

    /// The raw connector
    pub fn connector(&self) -> &Arc<dyn MintConnector> {
        &self.connector
    }

    /// Mint metadata, when the mint was reachable
    pub fn info(&self) -> Option<&MintInfo> {
        self.info.as_ref()
    }

    /// Whether the wallet initialised without reaching the mint.
    /// Offline mode permits balance reads but refuses transitions.
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Error unless the mint was reachable at initialisation
    pub fn require_online(&self) -> Result<(), Error> {
        if self.offline {
            return Err(Error::Offline(self.mint_url.to_string()));
        }
        Ok(())
    }

    /// The active keyset for a unit
    pub fn active_keyset(&self, unit: CurrencyUnit) -> Result<&KeySetInfo, Error> {
        self.require_online()?;
        self.keysets
            .iter()
            .find(|k| k.unit == unit && k.active)
            .ok_or(Error::NoActiveKeyset)
    }

    /// Input fee ppk of a keyset
    pub fn input_fee_ppk(&self, keyset_id: &Id) -> Result<u64, Error> {
        self.keysets
            .iter()
            .find(|k| &k.id == keyset_id)
            .map(|k| k.input_fee_ppk)
            .ok_or_else(|| Error::KeysetUnknown(keyset_id.to_string()))
    }

    /// Keys of a keyset, fetched once and cached
    pub async fn keyset_keys(&self, keyset_id: Id) -> Result<Keys, Error> {
        if let Some(keys) = self.keys.lock().await.get(&keyset_id) {
            return Ok(keys.clone());
        }
        self.require_online()?;
        let keyset = self.connector.get_keys(keyset_id).await?;
        let keys = keyset.keys.clone();
        self.keys.lock().await.insert(keyset_id, keys.clone());
        Ok(keys)
    }
}

/// Builds connectors for mint urls; injected so tests can run against
/// an in-process mint.
pub type ConnectorFactory =
    Box<dyn Fn(&MintUrl) -> Arc<dyn MintConnector> + Send + Sync>;

/// One initialised [`MintService`] per mint url, with single-flight
/// initialisation.
pub struct MintRegistry {
    factory: ConnectorFactory,
    services: Mutex<HashMap<MintUrl, Arc<OnceCell<Arc<MintService>>>>>,
}

impl Debug for MintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintRegistry").finish_non_exhaustive()
    }
}

impl MintRegistry {
    /// New registry over a connector factory
    pub fn new(factory: ConnectorFactory) -> Self {
        Self {
            factory,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Registry that talks HTTP to real mints
    pub fn http() -> Self {
        Self::new(Box::new(|mint_url| {
            Arc::new(HttpMintConnector::new(mint_url.clone()))
        }))
    }

    /// The service for a mint, initialising it exactly once per url
    /// even under concurrent callers.
    pub async fn service(&self, mint_url: &MintUrl) -> Result<Arc<MintService>, Error> {
        let cell = {
            let mut services = self.services.lock().await;
            services
                .entry(mint_url.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let service = cell
            .get_or_init(|| async {
                let connector = (self.factory)(mint_url);
                Arc::new(MintService::initialize(mint_url.clone(), connector).await)
            })
            .await;

        Ok(service.clone())
    }
}
