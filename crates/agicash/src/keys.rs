//! Wallet key material
//!
//! The seed comes from an external key provider; the engine only
//! derives from it and never persists it.

use std::fmt;

use bip39::Mnemonic;

/// The wallet's root seed.
///
/// All deterministic output secrets, blinding factors and quote locking
/// keys derive from this seed; losing it invalidates every outstanding
/// locked quote and unminted output.
#[derive(Clone)]
pub struct WalletKeys {
    seed: [u8; 64],
}

impl WalletKeys {
    /// From a raw 64-byte seed
    pub fn from_seed(seed: [u8; 64]) -> Self {
        Self { seed }
    }

    /// From a bip39 mnemonic
    pub fn from_mnemonic(mnemonic: &Mnemonic) -> Self {
        Self {
            seed: mnemonic.to_seed(""),
        }
    }

    /// The seed bytes
    pub fn seed(&self) -> &[u8; 64] {
        &self.seed
    }
}

impl fmt::Debug for WalletKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeys").finish_non_exhaustive()
    }
}
