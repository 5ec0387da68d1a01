//! Test doubles: an in-process mint that really signs, a fake Spark
//! backend, and a shared fake Lightning network connecting them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use agicash_common::amount::CurrencyUnit;
use agicash_common::dhke::hash_to_curve;
use agicash_common::keyset::{Id, KeySet, KeySetInfo, Keys};
use agicash_common::mint::{
    CheckStateRequest, CheckStateResponse, CheckedProofState, MeltQuoteRequest, MeltQuoteResponse,
    MeltQuoteState, MeltRequest, MintInfo, MintQuoteRequest, MintQuoteResponse, MintQuoteState,
    MintRequest, MintResponse, ProofStateInfo, RestoreRequest, RestoreResponse, SwapRequest,
    SwapResponse,
};
use agicash_common::outputs::verify_mint_request;
use agicash_common::proof::{
    BlindSignature, BlindedMessage, Proof, Proofs, ProofsMethods, PublicKey, SecretKey,
};
use agicash_common::secret::Secret;
use agicash_common::util::{hex, unix_time};
use agicash_common::{Amount, Error, SECP256K1};
use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::rand::{thread_rng, Rng};
use bitcoin::secp256k1::Scalar;
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use tokio::sync::Mutex;

use crate::mint::MintConnector;
use crate::spark::{
    SparkConnector, SparkLightningReceiveRequest, SparkPayment, SparkPaymentStatus,
    SparkReceiveStatus,
};

/// Install the test tracing subscriber once
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Build a signed bolt11 invoice with a random payment hash.
/// Returns the encoded invoice and the payment hash hex.
pub fn fake_invoice(amount_msat: u64, description: String) -> (String, String) {
    let private_key = SecretKey::from_slice(
        &[
            0xe1, 0x26, 0xf6, 0x8f, 0x7e, 0xaf, 0xcc, 0x8b, 0x74, 0xf5, 0x4d, 0x26, 0x9f, 0xe2,
            0x06, 0xbe, 0x71, 0x50, 0x00, 0xf9, 0x4d, 0xac, 0x06, 0x7d, 0x1c, 0x04, 0xa8, 0xca,
            0x3b, 0x2d, 0xb7, 0x34,
        ][..],
    )
    .expect("valid key bytes");

    let mut random_bytes = [0u8; 32];
    thread_rng().fill(&mut random_bytes);
    let payment_hash = sha256::Hash::from_slice(&random_bytes).expect("32 bytes");
    let payment_secret = PaymentSecret([42u8; 32]);

    let invoice = InvoiceBuilder::new(Currency::Bitcoin)
        .description(description)
        .payment_hash(payment_hash)
        .payment_secret(payment_secret)
        .amount_milli_satoshis(amount_msat)
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .build_signed(|hash| SECP256K1.sign_ecdsa_recoverable(hash, &private_key))
        .expect("valid invoice");

    (invoice.to_string(), hex::encode(payment_hash.to_byte_array()))
}

fn random_hex32() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// The set of settled payment hashes, shared between fakes so a melt
/// on one mint can pay an invoice issued by another backend.
#[derive(Debug, Default, Clone)]
pub struct FakeLightningNetwork {
    paid: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl FakeLightningNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle a payment hash
    pub fn settle(&self, payment_hash: &str) {
        if let Ok(mut paid) = self.paid.lock() {
            paid.insert(payment_hash.to_string());
        }
    }

    /// Whether a payment hash settled
    pub fn is_paid(&self, payment_hash: &str) -> bool {
        self.paid
            .lock()
            .map(|paid| paid.contains(payment_hash))
            .unwrap_or(false)
    }
}

struct StoredMintQuote {
    response: MintQuoteResponse,
    amount: Amount,
    payment_hash: String,
    issued: bool,
}

struct StoredMeltQuote {
    response: MeltQuoteResponse,
    payment_hash: String,
}

struct MintState {
    mint_quotes: HashMap<String, StoredMintQuote>,
    melt_quotes: HashMap<String, StoredMeltQuote>,
    /// Everything ever signed, by blinded secret; backs restore and
    /// the already-signed guard
    signed: HashMap<PublicKey, BlindSignature>,
    spent: HashSet<PublicKey>,
    quote_counter: u64,
    /// Lightning fee the next melts will charge out of the reserve
    lightning_fee: Amount,
}

/// An in-process mint with real BDHKE signing.
///
/// Mint quotes are paid through the shared [`FakeLightningNetwork`];
/// melts settle the invoice's payment hash on it.
#[derive(Clone)]
pub struct FakeMint {
    keyset_id: Id,
    secret_keys: Arc<BTreeMap<Amount, SecretKey>>,
    keys: Keys,
    unit: CurrencyUnit,
    fee_ppk: u64,
    network: FakeLightningNetwork,
    state: Arc<Mutex<MintState>>,
}

impl std::fmt::Debug for FakeMint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeMint")
            .field("keyset_id", &self.keyset_id)
            .finish_non_exhaustive()
    }
}

impl FakeMint {
    /// New sat-denominated mint with the given input fee
    pub fn new(fee_ppk: u64) -> Self {
        Self::with_network(fee_ppk, CurrencyUnit::Sat, FakeLightningNetwork::new())
    }

    /// New mint on a shared Lightning network
    pub fn with_network(fee_ppk: u64, unit: CurrencyUnit, network: FakeLightningNetwork) -> Self {
        let mut secret_keys = BTreeMap::new();
        let mut pub_keys = BTreeMap::new();
        for bit in 0..32u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = bit + 1;
            bytes[31] = 0x77;
            let secret = SecretKey::from_slice(&bytes).expect("valid key bytes");
            let amount = Amount::from(1u64 << bit);
            pub_keys.insert(amount, secret.public_key(&SECP256K1));
            secret_keys.insert(amount, secret);
        }
        let keys = Keys::new(pub_keys);
        let keyset_id = Id::from_keys(&keys);

        Self {
            keyset_id,
            secret_keys: Arc::new(secret_keys),
            keys,
            unit,
            fee_ppk,
            network,
            state: Arc::new(Mutex::new(MintState {
                mint_quotes: HashMap::new(),
                melt_quotes: HashMap::new(),
                signed: HashMap::new(),
                spent: HashSet::new(),
                quote_counter: 0,
                lightning_fee: Amount::ZERO,
            })),
        }
    }

    /// This mint as a connector
    pub fn connector(&self) -> Arc<dyn MintConnector> {
        Arc::new(self.clone())
    }

    /// The mint's single keyset id
    pub fn keyset_id(&self) -> Id {
        self.keyset_id
    }

    /// The shared Lightning network
    pub fn network(&self) -> FakeLightningNetwork {
        self.network.clone()
    }

    /// Settle the invoice of a mint quote, as an external payer would
    pub async fn pay_mint_quote(&self, quote_id: &str) {
        let state = self.state.lock().await;
        if let Some(quote) = state.mint_quotes.get(quote_id) {
            self.network.settle(&quote.payment_hash);
        }
    }

    /// Lightning fee future melts will charge out of the reserve
    pub async fn set_lightning_fee(&self, fee: Amount) {
        self.state.lock().await.lightning_fee = fee;
    }

    /// Issue proofs directly, as another wallet's mint would have.
    /// Used to fabricate incoming tokens.
    pub async fn issue_proofs(&self, amounts: &[Amount]) -> Proofs {
        let mut proofs = Vec::with_capacity(amounts.len());
        for &amount in amounts {
            let secret = Secret::generate();
            let y = hash_to_curve(secret.as_bytes()).expect("point for secret");
            let c = self.sign_point(amount, &y);
            proofs.push(Proof {
                amount,
                keyset_id: self.keyset_id,
                secret,
                c,
            });
        }
        proofs
    }

    fn sign_point(&self, amount: Amount, point: &PublicKey) -> PublicKey {
        let secret_key = self
            .secret_keys
            .get(&amount)
            .expect("amount is a signed power of two");
        point
            .mul_tweak(&SECP256K1, &Scalar::from(*secret_key))
            .expect("valid tweak")
    }

    fn verify_proof(&self, proof: &Proof) -> Result<(), Error> {
        let y = hash_to_curve(proof.secret.as_bytes())
            .map_err(|e| Error::Custom(e.to_string()))?;
        let expected = self.sign_point(proof.amount, &y);
        if proof.c != expected {
            return Err(Error::Custom("invalid proof signature".to_string()));
        }
        Ok(())
    }

    fn mint_error(code: agicash_common::error::MintErrorCode, detail: &str) -> Error {
        Error::MintOperation(agicash_common::error::MintOperationError::new(
            Some(code),
            detail,
        ))
    }

    fn sign_outputs(
        &self,
        state: &mut MintState,
        outputs: &[BlindedMessage],
        amounts: Option<&[Amount]>,
    ) -> Result<Vec<BlindSignature>, Error> {
        use agicash_common::error::MintErrorCode;

        for output in outputs.iter().take(amounts.map_or(outputs.len(), |a| a.len())) {
            if state.signed.contains_key(&output.blinded_secret) {
                return Err(Self::mint_error(
                    MintErrorCode::OutputAlreadySigned,
                    "outputs have already been signed before",
                ));
            }
        }

        let mut signatures = Vec::new();
        for (index, output) in outputs.iter().enumerate() {
            let amount = match amounts {
                Some(amounts) => match amounts.get(index) {
                    Some(&amount) => amount,
                    None => break,
                },
                None => output.amount,
            };
            if amount == Amount::ZERO {
                continue;
            }
            let c = self.sign_point(amount, &output.blinded_secret);
            let signature = BlindSignature {
                amount,
                keyset_id: self.keyset_id,
                c,
                dleq: None,
            };
            state.signed.insert(output.blinded_secret, signature);
            signatures.push(signature);
        }
        Ok(signatures)
    }
}

#[async_trait]
impl MintConnector for FakeMint {
    async fn get_mint_info(&self) -> Result<MintInfo, Error> {
        Ok(MintInfo {
            name: Some("fake mint".to_string()),
            version: Some("agicash-fake/0.1".to_string()),
            description: None,
        })
    }

    async fn get_keysets(&self) -> Result<Vec<KeySetInfo>, Error> {
        Ok(vec![KeySetInfo {
            id: self.keyset_id,
            unit: self.unit,
            active: true,
            input_fee_ppk: self.fee_ppk,
        }])
    }

    async fn get_keys(&self, keyset_id: Id) -> Result<KeySet, Error> {
        if keyset_id != self.keyset_id {
            return Err(Error::KeysetUnknown(keyset_id.to_string()));
        }
        Ok(KeySet {
            id: self.keyset_id,
            unit: self.unit,
            keys: self.keys.clone(),
        })
    }

    async fn create_mint_quote(
        &self,
        request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error> {
        let mut state = self.state.lock().await;
        state.quote_counter += 1;
        let quote_id = format!("mint-quote-{}", state.quote_counter);
        let (invoice, payment_hash) = fake_invoice(
            request.amount.value() * 1000,
            request.description.unwrap_or_default(),
        );
        let response = MintQuoteResponse {
            quote: quote_id.clone(),
            request: invoice,
            state: MintQuoteState::Unpaid,
            expiry: unix_time() + 3600,
            pubkey: request.pubkey,
        };
        state.mint_quotes.insert(
            quote_id,
            StoredMintQuote {
                response: response.clone(),
                amount: request.amount,
                payment_hash,
                issued: false,
            },
        );
        Ok(response)
    }

    async fn check_mint_quote(&self, quote_id: &str) -> Result<MintQuoteResponse, Error> {
        let mut state = self.state.lock().await;
        let quote = state
            .mint_quotes
            .get_mut(quote_id)
            .ok_or_else(|| Error::NotFound("mint quote", quote_id.to_string()))?;
        if quote.response.state == MintQuoteState::Unpaid
            && self.network.is_paid(&quote.payment_hash)
        {
            quote.response.state = MintQuoteState::Paid;
        }
        Ok(quote.response.clone())
    }

    async fn mint_proofs(&self, request: MintRequest) -> Result<MintResponse, Error> {
        use agicash_common::error::MintErrorCode;

        let mut state = self.state.lock().await;
        let quote = state
            .mint_quotes
            .get(&request.quote)
            .ok_or_else(|| Error::NotFound("mint quote", request.quote.clone()))?;

        if quote.issued {
            return Err(Self::mint_error(
                MintErrorCode::QuoteAlreadyIssued,
                "quote already issued",
            ));
        }
        if quote.response.state == MintQuoteState::Unpaid && !self.network.is_paid(&quote.payment_hash)
        {
            return Err(Self::mint_error(
                MintErrorCode::QuoteNotPaid,
                "quote not paid",
            ));
        }
        let total: Amount = request.outputs.iter().map(|o| o.amount).sum();
        if total != quote.amount {
            return Err(Self::mint_error(
                MintErrorCode::TransactionUnbalanced,
                "outputs do not match quote amount",
            ));
        }
        if let Some(pubkey) = quote.response.pubkey {
            let signature = request
                .signature
                .as_deref()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|bytes| {
                    bitcoin::secp256k1::schnorr::Signature::from_slice(&bytes).ok()
                })
                .ok_or_else(|| Error::Custom("missing quote signature".to_string()))?;
            if !verify_mint_request(&pubkey, &request.quote, &request.outputs, &signature) {
                return Err(Error::Custom("invalid quote signature".to_string()));
            }
        }

        let signatures = self.sign_outputs(&mut state, &request.outputs, None)?;
        if let Some(quote) = state.mint_quotes.get_mut(&request.quote) {
            quote.issued = true;
            quote.response.state = MintQuoteState::Issued;
        }
        Ok(MintResponse { signatures })
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, Error> {
        use agicash_common::error::MintErrorCode;

        let mut state = self.state.lock().await;
        let mut input_ys = Vec::new();
        for input in &request.inputs {
            self.verify_proof(input)?;
            let y = hash_to_curve(input.secret.as_bytes())
                .map_err(|e| Error::Custom(e.to_string()))?;
            if state.spent.contains(&y) {
                return Err(Self::mint_error(
                    MintErrorCode::TokenAlreadySpent,
                    "token already spent",
                ));
            }
            input_ys.push(y);
        }

        let input_total = request.inputs.total_amount();
        let output_total: Amount = request.outputs.iter().map(|o| o.amount).sum();
        let fee = crate::fees::input_fee(request.inputs.len(), self.fee_ppk);
        if input_total != output_total.checked_add(fee)? {
            return Err(Self::mint_error(
                MintErrorCode::TransactionUnbalanced,
                "inputs do not cover outputs plus fee",
            ));
        }

        let signatures = self.sign_outputs(&mut state, &request.outputs, None)?;
        state.spent.extend(input_ys);
        Ok(SwapResponse { signatures })
    }

    async fn create_melt_quote(
        &self,
        request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        let mut state = self.state.lock().await;
        state.quote_counter += 1;
        let quote_id = format!("melt-quote-{}", state.quote_counter);
        let amount = crate::invoice::amount_sats(&request.request)?;
        let payment_hash = crate::invoice::payment_hash(&request.request)?;
        let response = MeltQuoteResponse {
            quote: quote_id.clone(),
            amount,
            fee_reserve: Amount::from((amount.value() / 100).max(1)),
            state: MeltQuoteState::Unpaid,
            expiry: unix_time() + 3600,
            payment_preimage: None,
            change: None,
        };
        state.melt_quotes.insert(
            quote_id,
            StoredMeltQuote {
                response: response.clone(),
                payment_hash,
            },
        );
        Ok(response)
    }

    async fn melt_proofs(&self, request: MeltRequest) -> Result<MeltQuoteResponse, Error> {
        use agicash_common::error::MintErrorCode;

        let mut state = self.state.lock().await;
        let stored = state
            .melt_quotes
            .get(&request.quote)
            .ok_or_else(|| Error::NotFound("melt quote", request.quote.clone()))?;

        // Idempotent by quote id: a settled quote returns its outcome
        if stored.response.state == MeltQuoteState::Paid {
            return Ok(stored.response.clone());
        }
        let quote_amount = stored.response.amount;
        let fee_reserve = stored.response.fee_reserve;
        let payment_hash = stored.payment_hash.clone();

        let mut input_ys = Vec::new();
        for input in &request.inputs {
            self.verify_proof(input)?;
            let y = hash_to_curve(input.secret.as_bytes())
                .map_err(|e| Error::Custom(e.to_string()))?;
            if state.spent.contains(&y) {
                return Err(Self::mint_error(
                    MintErrorCode::TokenAlreadySpent,
                    "token already spent",
                ));
            }
            input_ys.push(y);
        }

        let input_total = request.inputs.total_amount();
        let input_fee = crate::fees::input_fee(request.inputs.len(), self.fee_ppk);
        if input_total < quote_amount.checked_add(input_fee)? {
            return Err(Self::mint_error(
                MintErrorCode::TransactionUnbalanced,
                "inputs do not cover melt amount",
            ));
        }

        let lightning_fee = state.lightning_fee.min(fee_reserve);
        let change_amount = input_total
            .checked_sub(quote_amount)?
            .checked_sub(input_fee)?
            .checked_sub(lightning_fee)
            .unwrap_or(Amount::ZERO);

        let change = match &request.outputs {
            Some(outputs) if change_amount > Amount::ZERO => {
                let mut amounts = change_amount.split();
                amounts.truncate(outputs.len());
                Some(self.sign_outputs(&mut state, outputs, Some(&amounts))?)
            }
            _ => None,
        };

        state.spent.extend(input_ys);
        self.network.settle(&payment_hash);

        let stored = state
            .melt_quotes
            .get_mut(&request.quote)
            .ok_or_else(|| Error::NotFound("melt quote", request.quote.clone()))?;
        stored.response.state = MeltQuoteState::Paid;
        stored.response.payment_preimage = Some(random_hex32());
        stored.response.change = change;
        Ok(stored.response.clone())
    }

    async fn check_melt_quote(&self, quote_id: &str) -> Result<MeltQuoteResponse, Error> {
        let state = self.state.lock().await;
        state
            .melt_quotes
            .get(quote_id)
            .map(|stored| stored.response.clone())
            .ok_or_else(|| Error::NotFound("melt quote", quote_id.to_string()))
    }

    async fn check_proof_states(
        &self,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        let state = self.state.lock().await;
        let states = request
            .ys
            .into_iter()
            .map(|y| ProofStateInfo {
                y,
                state: if state.spent.contains(&y) {
                    CheckedProofState::Spent
                } else {
                    CheckedProofState::Unspent
                },
            })
            .collect();
        Ok(CheckStateResponse { states })
    }

    async fn restore(&self, request: RestoreRequest) -> Result<RestoreResponse, Error> {
        let state = self.state.lock().await;
        let mut outputs = Vec::new();
        let mut signatures = Vec::new();
        for output in request.outputs {
            if let Some(signature) = state.signed.get(&output.blinded_secret) {
                outputs.push(output);
                signatures.push(*signature);
            }
        }
        Ok(RestoreResponse {
            outputs,
            signatures,
        })
    }
}

struct SparkState {
    receives: HashMap<String, SparkLightningReceiveRequest>,
    payments: HashMap<String, SparkPayment>,
    counter: u64,
}

/// Fake Spark backend on the shared Lightning network
pub struct FakeSpark {
    identity: PublicKey,
    network: FakeLightningNetwork,
    state: Mutex<SparkState>,
}

impl std::fmt::Debug for FakeSpark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSpark").finish_non_exhaustive()
    }
}

impl FakeSpark {
    /// New backend on its own network
    pub fn new() -> Self {
        Self::with_network(FakeLightningNetwork::new())
    }

    /// New backend on a shared network
    pub fn with_network(network: FakeLightningNetwork) -> Self {
        let identity = SecretKey::from_slice(&[0x42u8; 32])
            .expect("valid key bytes")
            .public_key(&SECP256K1);
        Self {
            identity,
            network,
            state: Mutex::new(SparkState {
                receives: HashMap::new(),
                payments: HashMap::new(),
                counter: 0,
            }),
        }
    }
}

#[async_trait]
impl SparkConnector for FakeSpark {
    fn identity_public_key(&self) -> PublicKey {
        self.identity
    }

    async fn create_lightning_invoice(
        &self,
        amount_sats: Amount,
        description: Option<String>,
        _receiver_identity_pubkey: Option<PublicKey>,
    ) -> Result<SparkLightningReceiveRequest, Error> {
        let mut state = self.state.lock().await;
        state.counter += 1;
        let id = format!("spark-receive-{}", state.counter);
        let (invoice, payment_hash) =
            fake_invoice(amount_sats.value() * 1000, description.unwrap_or_default());
        let request = SparkLightningReceiveRequest {
            id: id.clone(),
            status: SparkReceiveStatus::Unpaid,
            payment_request: invoice,
            payment_hash,
            amount_sats,
            expires_at: unix_time() + 3600,
            payment_preimage: None,
            transfer_id: None,
        };
        state.receives.insert(id, request.clone());
        Ok(request)
    }

    async fn get_lightning_receive_request(
        &self,
        id: &str,
    ) -> Result<SparkLightningReceiveRequest, Error> {
        let mut state = self.state.lock().await;
        let counter = state.counter;
        let request = state
            .receives
            .get_mut(id)
            .ok_or_else(|| Error::NotFound("spark receive request", id.to_string()))?;
        if request.status == SparkReceiveStatus::Unpaid && self.network.is_paid(&request.payment_hash)
        {
            request.status = SparkReceiveStatus::TransferCompleted;
            request.payment_preimage = Some(random_hex32());
            request.transfer_id = Some(format!("spark-transfer-{counter}"));
        }
        Ok(request.clone())
    }

    async fn pay_invoice(
        &self,
        payment_request: &str,
        _max_fee_sats: Amount,
    ) -> Result<SparkPayment, Error> {
        let payment_hash = crate::invoice::payment_hash(payment_request)?;
        self.network.settle(&payment_hash);

        let mut state = self.state.lock().await;
        state.counter += 1;
        let payment = SparkPayment {
            id: format!("spark-payment-{}", state.counter),
            status: SparkPaymentStatus::Completed,
            fee_sats: Amount::ONE,
            payment_preimage: Some(random_hex32()),
        };
        state.payments.insert(payment.id.clone(), payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, id: &str) -> Result<SparkPayment, Error> {
        let state = self.state.lock().await;
        state
            .payments
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound("spark payment", id.to_string()))
    }
}
