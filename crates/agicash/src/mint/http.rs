//! HTTP mint connector

use agicash_common::keyset::{Id, KeySet, KeySetInfo};
use agicash_common::mint::{
    CheckStateRequest, CheckStateResponse, ErrorResponse, KeysResponse, KeysetResponse,
    MeltQuoteRequest, MeltQuoteResponse, MeltRequest, MintInfo, MintQuoteRequest,
    MintQuoteResponse, MintRequest, MintResponse, RestoreRequest, RestoreResponse, SwapRequest,
    SwapResponse,
};
use agicash_common::{Error, MintUrl};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use super::MintConnector;

/// [`MintConnector`] over the mint's HTTP API
#[derive(Debug, Clone)]
pub struct HttpMintConnector {
    mint_url: MintUrl,
    client: Client,
}

impl HttpMintConnector {
    /// New connector for one mint
    pub fn new(mint_url: MintUrl) -> Self {
        Self {
            mint_url,
            client: Client::new(),
        }
    }

    /// Parse a response that is either the expected type or a mint
    /// error body.
    fn parse<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => Ok(parsed),
            Err(err) => match serde_json::from_value::<ErrorResponse>(value) {
                Ok(error_response) => Err(Error::MintOperation(error_response.into())),
                Err(_) => Err(Error::Network(err.to_string())),
            },
        }
    }

    async fn get<T: DeserializeOwned>(&self, paths: &[&str]) -> Result<T, Error> {
        let url = self.mint_url.join_paths(paths)?;
        let value = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?
            .json::<Value>()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Self::parse(value)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        paths: &[&str],
        body: &B,
    ) -> Result<T, Error> {
        let url = self.mint_url.join_paths(paths)?;
        let value = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?
            .json::<Value>()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Self::parse(value)
    }
}

#[async_trait]
impl MintConnector for HttpMintConnector {
    #[instrument(skip(self), fields(mint_url = %self.mint_url))]
    async fn get_mint_info(&self) -> Result<MintInfo, Error> {
        self.get(&["v1", "info"]).await
    }

    #[instrument(skip(self), fields(mint_url = %self.mint_url))]
    async fn get_keysets(&self) -> Result<Vec<KeySetInfo>, Error> {
        let response: KeysetResponse = self.get(&["v1", "keysets"]).await?;
        Ok(response.keysets)
    }

    #[instrument(skip(self), fields(mint_url = %self.mint_url))]
    async fn get_keys(&self, keyset_id: Id) -> Result<KeySet, Error> {
        let response: KeysResponse = self
            .get(&["v1", "keys", &keyset_id.to_string()])
            .await?;
        response
            .keysets
            .into_iter()
            .next()
            .ok_or_else(|| Error::KeysetUnknown(keyset_id.to_string()))
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn create_mint_quote(
        &self,
        request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error> {
        self.post(&["v1", "mint", "quote", "bolt11"], &request).await
    }

    #[instrument(skip(self), fields(mint_url = %self.mint_url))]
    async fn check_mint_quote(&self, quote_id: &str) -> Result<MintQuoteResponse, Error> {
        self.get(&["v1", "mint", "quote", "bolt11", quote_id]).await
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn mint_proofs(&self, request: MintRequest) -> Result<MintResponse, Error> {
        self.post(&["v1", "mint", "bolt11"], &request).await
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, Error> {
        self.post(&["v1", "swap"], &request).await
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn create_melt_quote(
        &self,
        request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        self.post(&["v1", "melt", "quote", "bolt11"], &request).await
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn melt_proofs(&self, request: MeltRequest) -> Result<MeltQuoteResponse, Error> {
        self.post(&["v1", "melt", "bolt11"], &request).await
    }

    #[instrument(skip(self), fields(mint_url = %self.mint_url))]
    async fn check_melt_quote(&self, quote_id: &str) -> Result<MeltQuoteResponse, Error> {
        self.get(&["v1", "melt", "quote", "bolt11", quote_id]).await
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn check_proof_states(
        &self,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        self.post(&["v1", "checkstate"], &request).await
    }

    #[instrument(skip_all, fields(mint_url = %self.mint_url))]
    async fn restore(&self, request: RestoreRequest) -> Result<RestoreResponse, Error> {
        self.post(&["v1", "restore"], &request).await
    }
}
