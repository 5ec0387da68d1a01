//! Agicash payment state engine
//!
//! Drives the durable per-operation records of a two-rail wallet: mint
//! quote receives, melt quote sends, same-mint token swaps and send
//! swaps on Cashu accounts, plus Lightning receives and sends on Spark
//! accounts. Every engine composes the shared proof ledger, the storage
//! procedures and a connector to the external service, and leaves each
//! record in a state the background processor can drive to terminal
//! after any crash.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod fees;
pub mod invoice;
pub mod keys;
pub mod ledger;
pub mod mint;
pub mod processor;
pub mod receive;
pub mod retry;
pub mod send;
pub mod spark;
pub mod swap;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

#[doc(hidden)]
pub use agicash_common::{self as common, Error};
#[doc(hidden)]
pub use keys::WalletKeys;
#[doc(hidden)]
pub use ledger::ProofLedger;
#[doc(hidden)]
pub use mint::{MintConnector, MintRegistry, MintService};
#[doc(hidden)]
pub use processor::BackgroundProcessor;
#[doc(hidden)]
pub use spark::{SparkConnector, SparkRegistry};
