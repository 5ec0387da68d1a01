//! Accounts

use std::collections::BTreeMap;

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{Currency, CurrencyUnit};
use crate::codec::{Validate, ValidationError};
use crate::error::Error;
use crate::keyset::Id;
use crate::mint_url::MintUrl;
use crate::util::unix_time;

/// Spark network an account lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SparkNetwork {
    /// Mainnet
    Mainnet,
    /// Regtest
    Regtest,
}

/// Cashu account details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashuAccountDetails {
    /// Mint holding the account's proofs
    pub mint_url: MintUrl,
    /// Whether the mint is a test mint (not real money)
    pub is_test_mint: bool,
    /// Next deterministic-output index per keyset.
    ///
    /// Advanced only inside the storage procedure that commits the
    /// record consuming the range.
    #[serde(default)]
    pub keyset_counters: BTreeMap<Id, u32>,
}

/// Spark account details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkAccountDetails {
    /// Network the Spark wallet is on
    pub network: SparkNetwork,
    /// Identity public key of the Spark wallet
    pub identity_pubkey: PublicKey,
}

/// Rail-specific account details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AccountDetails {
    /// Cashu mint account
    Cashu(CashuAccountDetails),
    /// Spark Lightning account
    Spark(SparkAccountDetails),
}

/// A user account on one payment rail, in one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Currency the account is denominated in
    pub currency: Currency,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Version for optimistic locking
    pub version: u32,
    /// Rail-specific details
    pub details: AccountDetails,
}

impl Account {
    /// New cashu account
    pub fn new_cashu(
        user_id: impl Into<String>,
        currency: Currency,
        mint_url: MintUrl,
        is_test_mint: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            currency,
            created_at: unix_time(),
            version: 0,
            details: AccountDetails::Cashu(CashuAccountDetails {
                mint_url,
                is_test_mint,
                keyset_counters: BTreeMap::new(),
            }),
        }
    }

    /// New spark account
    pub fn new_spark(
        user_id: impl Into<String>,
        currency: Currency,
        network: SparkNetwork,
        identity_pubkey: PublicKey,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            currency,
            created_at: unix_time(),
            version: 0,
            details: AccountDetails::Spark(SparkAccountDetails {
                network,
                identity_pubkey,
            }),
        }
    }

    /// Unit balances are counted in
    pub fn unit(&self) -> CurrencyUnit {
        self.currency.minor_unit()
    }

    /// Cashu details, or an error if this is not a cashu account
    pub fn cashu_details(&self) -> Result<&CashuAccountDetails, Error> {
        match &self.details {
            AccountDetails::Cashu(details) => Ok(details),
            AccountDetails::Spark(_) => Err(Error::WrongAccountKind("cashu")),
        }
    }

    /// Spark details, or an error if this is not a spark account
    pub fn spark_details(&self) -> Result<&SparkAccountDetails, Error> {
        match &self.details {
            AccountDetails::Spark(details) => Ok(details),
            AccountDetails::Cashu(_) => Err(Error::WrongAccountKind("spark")),
        }
    }

    /// Current deterministic-output counter for a keyset
    pub fn keyset_counter(&self, keyset_id: &Id) -> u32 {
        match &self.details {
            AccountDetails::Cashu(details) => {
                details.keyset_counters.get(keyset_id).copied().unwrap_or(0)
            }
            AccountDetails::Spark(_) => 0,
        }
    }

    /// Advance a keyset counter, verifying the caller derived from the
    /// current value.
    pub fn advance_keyset_counter(
        &mut self,
        keyset_id: Id,
        expected_start: u32,
        count: u32,
    ) -> Result<(), Error> {
        let details = match &mut self.details {
            AccountDetails::Cashu(details) => details,
            AccountDetails::Spark(_) => return Err(Error::WrongAccountKind("cashu")),
        };
        let counter = details.keyset_counters.entry(keyset_id).or_insert(0);
        if *counter != expected_start {
            return Err(Error::Concurrency {
                record: "account keyset counter",
                id: self.id.to_string(),
            });
        }
        *counter += count;
        self.version += 1;
        Ok(())
    }
}

impl Validate for Account {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.is_empty() {
            return Err(ValidationError::new("account user_id is empty"));
        }
        Ok(())
    }
}
