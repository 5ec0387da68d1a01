//! Deterministic output material
//!
//! Secrets and blinding factors are derived from the wallet seed along
//! bip32 paths keyed by keyset id and a per-keyset counter, so a
//! crashed operation can be replayed or restored against the mint with
//! the exact same blinded messages. Quote locking keys are derived the
//! same way from a user-scoped index.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::Keypair;
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{Message, PublicKey, SecretKey};
use bitcoin::Network;
use thiserror::Error;

use crate::amount::Amount;
use crate::dhke::blind_message;
use crate::keyset::Id;
use crate::proof::BlindedMessage;
use crate::secret::Secret;
use crate::util::hex;
use crate::SECP256K1;

/// Purpose index of all wallet derivation paths
const DERIVATION_PURPOSE: u32 = 129372;

/// Output derivation error
#[derive(Debug, Error)]
pub enum Error {
    /// DHKE error
    #[error(transparent)]
    Dhke(#[from] crate::dhke::Error),
    /// Bip32 error
    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),
    /// Secp256k1 error
    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
}

fn derive_path_from_keyset_id(id: Id) -> Result<DerivationPath, Error> {
    let keyset_child_number = ChildNumber::from_hardened_idx(u32::from(id))?;
    Ok(DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(DERIVATION_PURPOSE)?,
        ChildNumber::from_hardened_idx(0)?,
        keyset_child_number,
    ]))
}

fn derive_key(
    seed: &[u8; 64],
    keyset_id: Id,
    counter: u32,
    leaf: u32,
) -> Result<SecretKey, Error> {
    let xpriv = Xpriv::new_master(Network::Bitcoin, seed)?;
    let path = derive_path_from_keyset_id(keyset_id)?
        .child(ChildNumber::from_hardened_idx(counter)?)
        .child(ChildNumber::from_normal_idx(leaf)?);
    let derived = xpriv.derive_priv(&SECP256K1, &path)?;
    Ok(derived.private_key)
}

impl Secret {
    /// Deterministic [`Secret`] for (seed, keyset, counter)
    pub fn from_seed(seed: &[u8; 64], keyset_id: Id, counter: u32) -> Result<Self, Error> {
        let key = derive_key(seed, keyset_id, counter, 0)?;
        Ok(Self::new(hex::encode(key.secret_bytes())))
    }
}

/// Deterministic blinding factor for (seed, keyset, counter)
pub fn blinding_factor_from_seed(
    seed: &[u8; 64],
    keyset_id: Id,
    counter: u32,
) -> Result<SecretKey, Error> {
    derive_key(seed, keyset_id, counter, 1)
}

/// One pre-computed output: the blinded message together with the
/// material needed to unblind the mint's signature
#[derive(Debug, Clone)]
pub struct PreMint {
    /// Blinded message to send to the mint
    pub blinded_message: BlindedMessage,
    /// Secret of the eventual proof
    pub secret: Secret,
    /// Blinding factor
    pub r: SecretKey,
    /// Amount of the output
    pub amount: Amount,
}

/// The full set of pre-computed outputs for one mint or swap call
#[derive(Debug, Clone)]
pub struct PreMintSecrets {
    /// Keyset the outputs are bound to
    pub keyset_id: Id,
    /// First counter value used
    pub counter_start: u32,
    /// Outputs, in counter order
    pub secrets: Vec<PreMint>,
}

impl PreMintSecrets {
    /// Derive outputs for `amounts` starting at `counter_start`.
    ///
    /// Consumes one counter value per output; callers must advance the
    /// persistent keyset counter by `amounts.len()` in the same
    /// transaction that commits the dependent record.
    pub fn from_seed(
        seed: &[u8; 64],
        keyset_id: Id,
        counter_start: u32,
        amounts: &[Amount],
    ) -> Result<Self, Error> {
        let mut secrets = Vec::with_capacity(amounts.len());
        let mut counter = counter_start;

        for &amount in amounts {
            let secret = Secret::from_seed(seed, keyset_id, counter)?;
            let blinding_factor = blinding_factor_from_seed(seed, keyset_id, counter)?;

            let (blinded, r) = blind_message(secret.as_bytes(), &blinding_factor)?;

            secrets.push(PreMint {
                blinded_message: BlindedMessage {
                    amount,
                    keyset_id,
                    blinded_secret: blinded,
                },
                secret,
                r,
                amount,
            });
            counter += 1;
        }

        Ok(Self {
            keyset_id,
            counter_start,
            secrets,
        })
    }

    /// Blinded messages in counter order
    pub fn blinded_messages(&self) -> Vec<BlindedMessage> {
        self.secrets.iter().map(|p| p.blinded_message).collect()
    }

    /// Blinding factors in counter order
    pub fn rs(&self) -> Vec<SecretKey> {
        self.secrets.iter().map(|p| p.r).collect()
    }

    /// Secrets in counter order
    pub fn secrets(&self) -> Vec<Secret> {
        self.secrets.iter().map(|p| p.secret.clone()).collect()
    }

    /// Sum of output amounts
    pub fn total_amount(&self) -> Amount {
        self.secrets.iter().map(|p| p.amount).sum()
    }

    /// Number of counter values consumed
    pub fn count(&self) -> u32 {
        self.secrets.len() as u32
    }
}

/// A key a mint quote is locked to, derived from the wallet seed at
/// `m/129372'/0'/0'/index`.
#[derive(Debug, Clone)]
pub struct LockingKey {
    /// Derivation path of the key
    pub derivation_path: DerivationPath,
    /// Secret key that signs the mint request
    pub secret_key: SecretKey,
    /// Public key the quote is locked to
    pub public_key: PublicKey,
}

/// Derive the locking key for a quote index.
///
/// The base path is a durable commitment: changing it invalidates every
/// outstanding locked quote.
pub fn derive_locking_key(seed: &[u8; 64], index: u32) -> Result<LockingKey, Error> {
    let path = DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(DERIVATION_PURPOSE)?,
        ChildNumber::from_hardened_idx(0)?,
        ChildNumber::from_hardened_idx(0)?,
        ChildNumber::from_normal_idx(index)?,
    ]);

    let xpriv = Xpriv::new_master(Network::Bitcoin, seed)?;
    let derived = xpriv.derive_priv(&SECP256K1, &path)?;
    let secret_key = derived.private_key;

    Ok(LockingKey {
        derivation_path: path,
        secret_key,
        public_key: secret_key.public_key(&SECP256K1),
    })
}

/// Sign a mint request with the quote's locking key.
///
/// The message is the quote id concatenated with the serialized blinded
/// secrets, hashed; the signature is BIP-340 schnorr.
pub fn sign_mint_request(
    locking_key: &SecretKey,
    quote_id: &str,
    blinded_messages: &[BlindedMessage],
) -> Result<Signature, Error> {
    let digest = mint_request_digest(quote_id, blinded_messages);
    let keypair = Keypair::from_secret_key(&SECP256K1, locking_key);
    let message = Message::from_digest(digest);
    Ok(SECP256K1.sign_schnorr(&message, &keypair))
}

/// Verify a mint request signature against the quote's locking pubkey
pub fn verify_mint_request(
    locking_pubkey: &PublicKey,
    quote_id: &str,
    blinded_messages: &[BlindedMessage],
    signature: &Signature,
) -> bool {
    let digest = mint_request_digest(quote_id, blinded_messages);
    let message = Message::from_digest(digest);
    let (xonly, _parity) = locking_pubkey.x_only_public_key();
    SECP256K1.verify_schnorr(signature, &message, &xonly).is_ok()
}

fn mint_request_digest(quote_id: &str, blinded_messages: &[BlindedMessage]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    bitcoin::hashes::HashEngine::input(&mut engine, quote_id.as_bytes());
    for message in blinded_messages {
        bitcoin::hashes::HashEngine::input(&mut engine, &message.blinded_secret.serialize());
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}
