//! Proofs and their ledger records

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::dhke::{self, hash_to_curve};
use crate::keyset::Id;
use crate::secret::Secret;

#[doc(hidden)]
pub use bitcoin::secp256k1::{PublicKey, SecretKey};

/// A set of [`Proof`]s
pub type Proofs = Vec<Proof>;

/// Helpers over proof sets
pub trait ProofsMethods {
    /// Sum of proof amounts
    fn total_amount(&self) -> Amount;

    /// Y values of all proofs
    fn ys(&self) -> Result<Vec<PublicKey>, dhke::Error>;
}

impl ProofsMethods for Proofs {
    fn total_amount(&self) -> Amount {
        self.iter().map(|p| p.amount).sum()
    }

    fn ys(&self) -> Result<Vec<PublicKey>, dhke::Error> {
        self.iter().map(|p| p.y()).collect()
    }
}

/// A bearer proof: unspent at the mint until its secret is shown
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    /// Amount the proof is worth
    pub amount: Amount,
    /// Keyset the proof is bound to
    #[serde(rename = "id")]
    pub keyset_id: Id,
    /// Proof secret
    pub secret: Secret,
    /// Unblinded mint signature
    #[serde(rename = "C")]
    pub c: PublicKey,
}

impl Proof {
    /// The proof's public identity `Y = hash_to_curve(secret)`.
    ///
    /// Unique per proof on the mint side; the ledger's double-insert
    /// guard indexes it.
    pub fn y(&self) -> Result<PublicKey, dhke::Error> {
        hash_to_curve(self.secret.as_bytes())
    }
}

/// Blinded message sent to the mint for signing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedMessage {
    /// Amount the signature will be worth
    pub amount: Amount,
    /// Keyset requested to sign
    #[serde(rename = "id")]
    pub keyset_id: Id,
    /// Blinded secret `B_`
    #[serde(rename = "B_")]
    pub blinded_secret: PublicKey,
}

/// DLEQ proof attached to a blind signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindSignatureDleq {
    /// Challenge
    pub e: SecretKey,
    /// Response
    pub s: SecretKey,
}

/// Blind signature returned by the mint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindSignature {
    /// Amount the signature is worth
    pub amount: Amount,
    /// Keyset that signed
    #[serde(rename = "id")]
    pub keyset_id: Id,
    /// Blinded signature `C_`
    #[serde(rename = "C_")]
    pub c: PublicKey,
    /// DLEQ proof that the advertised key signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dleq: Option<BlindSignatureDleq>,
}

/// Ledger state of a stored proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofState {
    /// Spendable by the owning account
    Unspent,
    /// Reserved by a non-terminal spending record
    PendingSpend,
    /// Consumed at the mint
    Spent,
}

/// A proof as stored in the per-account ledger.
///
/// `amount` and `secret` live inside the encrypted blob at rest; `y`,
/// the state and the spender tags are clear, indexable columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    /// Record id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Owning account
    pub account_id: Uuid,
    /// Keyset the proof is bound to
    pub keyset_id: Id,
    /// Public identity `Y = hash_to_curve(secret)`
    pub y: PublicKey,
    /// The proof itself
    pub proof: Proof,
    /// Ledger state
    pub state: ProofState,
    /// When the proof was reserved, if it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<u64>,
    /// Send quote currently spending this proof
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spending_send_quote_id: Option<Uuid>,
    /// Send swap this proof belongs to, either as a reserved input
    /// (state PENDING_SPEND) or as a committed proof-to-send
    /// (state UNSPENT, excluded from balance and selection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spending_send_swap_id: Option<Uuid>,
}

impl ProofRecord {
    /// Build a ledger record for a freshly inserted proof
    pub fn new(
        user_id: impl Into<String>,
        account_id: Uuid,
        proof: Proof,
    ) -> Result<Self, dhke::Error> {
        let y = proof.y()?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            account_id,
            keyset_id: proof.keyset_id,
            y,
            proof,
            state: ProofState::Unspent,
            reserved_at: None,
            spending_send_quote_id: None,
            spending_send_swap_id: None,
        })
    }

    /// Whether the proof counts toward balance and may be selected
    /// for spending
    pub fn is_spendable(&self) -> bool {
        self.state == ProofState::Unspent && self.spending_send_swap_id.is_none()
    }

    /// Whether any non-terminal spending record references this proof
    pub fn is_referenced(&self) -> bool {
        self.spending_send_quote_id.is_some() || self.spending_send_swap_id.is_some()
    }
}
