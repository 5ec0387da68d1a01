//! Common types, protocol primitives and storage traits for the Agicash
//! payment state engine.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod account;
pub mod amount;
pub mod codec;
pub mod database;
pub mod dhke;
pub mod error;
pub mod keyset;
pub mod mint;
pub mod mint_url;
pub mod outputs;
pub mod proof;
pub mod records;
pub mod secret;
pub mod token;
pub mod util;

#[doc(hidden)]
pub use self::account::{Account, AccountDetails};
#[doc(hidden)]
pub use self::amount::{Amount, Currency, CurrencyUnit, Money};
#[doc(hidden)]
pub use self::error::Error;
#[doc(hidden)]
pub use self::keyset::{Id, KeySetInfo, Keys};
#[doc(hidden)]
pub use self::mint_url::MintUrl;
#[doc(hidden)]
pub use self::proof::{Proof, ProofRecord, ProofState, Proofs, PublicKey, SecretKey};
#[doc(hidden)]
pub use self::secret::Secret;
#[doc(hidden)]
pub use self::token::Token;
#[doc(hidden)]
pub use self::util::SECP256K1;
