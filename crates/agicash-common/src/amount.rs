//! Amounts and money

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Amount error
#[derive(Debug, Error)]
pub enum Error {
    /// Amount overflow
    #[error("Amount overflow")]
    AmountOverflow,
    /// Amount underflow
    #[error("Amount underflow")]
    AmountUnderflow,
    /// Currency and unit do not belong together
    #[error("Unit `{0}` is not the minor unit of `{1}`")]
    UnitMismatch(CurrencyUnit, Currency),
    /// Cannot mix currencies
    #[error("Cannot combine `{0}` with `{1}`")]
    CurrencyMismatch(Currency, Currency),
    /// Unknown currency tag
    #[error("Unknown currency `{0}`")]
    UnknownCurrency(String),
}

/// Integer amount in the smallest unit of a currency (sat, cent)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero amount
    pub const ZERO: Amount = Amount(0);
    /// One of the smallest unit
    pub const ONE: Amount = Amount(1);

    /// Split into parts that are powers of two
    pub fn split(&self) -> Vec<Self> {
        let value = self.0;
        (0_u64..64)
            .rev()
            .filter_map(|bit| {
                let part = 1 << bit;
                ((value & part) == part).then_some(Self(part))
            })
            .collect()
    }

    /// Checked addition, erroring on overflow
    pub fn checked_add(self, other: Amount) -> Result<Amount, Error> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(Error::AmountOverflow)
    }

    /// Checked subtraction, erroring on underflow
    pub fn checked_sub(self, other: Amount) -> Result<Amount, Error> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(Error::AmountUnderflow)
    }

    /// Sum an iterator of amounts, erroring on overflow
    pub fn try_sum<I: IntoIterator<Item = Self>>(iter: I) -> Result<Self, Error> {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, amount| acc.checked_add(amount))
    }

    /// Inner integer value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Amount> for u64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl core::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Amount(iter.map(|amount| amount.0).sum())
    }
}

/// Currency an account is denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Bitcoin
    Btc,
    /// US dollar
    Usd,
}

impl Currency {
    /// The smallest unit of this currency
    pub fn minor_unit(&self) -> CurrencyUnit {
        match self {
            Currency::Btc => CurrencyUnit::Sat,
            Currency::Usd => CurrencyUnit::Cent,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Btc => write!(f, "BTC"),
            Currency::Usd => write!(f, "USD"),
        }
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(Currency::Btc),
            "USD" => Ok(Currency::Usd),
            _ => Err(Error::UnknownCurrency(s.to_string())),
        }
    }
}

/// Unit amounts are counted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyUnit {
    /// Satoshi
    Sat,
    /// US cent
    Cent,
}

impl fmt::Display for CurrencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrencyUnit::Sat => write!(f, "sat"),
            CurrencyUnit::Cent => write!(f, "cent"),
        }
    }
}

/// An exact money value: integer amount in the smallest unit of a currency.
///
/// Serialized as a tagged object so the at-rest blob round trip is
/// self-describing and lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Money {
    /// Amount in `unit`
    pub amount: Amount,
    /// Currency
    pub currency: Currency,
    /// Unit the amount is counted in
    pub unit: CurrencyUnit,
}

impl Money {
    /// New [`Money`] in the currency's smallest unit
    pub fn new(amount: Amount, currency: Currency) -> Self {
        Self {
            amount,
            currency,
            unit: currency.minor_unit(),
        }
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        Self::new(Amount::ZERO, currency)
    }

    /// Validate that the unit belongs to the currency
    pub fn check_unit(&self) -> Result<(), Error> {
        if self.unit != self.currency.minor_unit() {
            return Err(Error::UnitMismatch(self.unit, self.currency));
        }
        Ok(())
    }

    /// Checked addition of two money values of the same currency
    pub fn checked_add(self, other: Money) -> Result<Money, Error> {
        if self.currency != other.currency {
            return Err(Error::CurrencyMismatch(self.currency, other.currency));
        }
        Ok(Money::new(
            self.amount.checked_add(other.amount)?,
            self.currency,
        ))
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        (self.currency == other.currency).then(|| self.amount.cmp(&other.amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_amount() {
        assert_eq!(Amount::from(1).split(), vec![Amount::from(1)]);
        assert_eq!(Amount::from(2).split(), vec![Amount::from(2)]);
        assert_eq!(
            Amount::from(3).split(),
            vec![Amount::from(2), Amount::from(1)]
        );
        let amounts: Vec<Amount> = [8, 2, 1].iter().map(|a| Amount::from(*a)).collect();
        assert_eq!(Amount::from(11).split(), amounts);
        let amounts: Vec<Amount> = [128, 64, 32, 16, 8, 4, 2, 1]
            .iter()
            .map(|a| Amount::from(*a))
            .collect();
        assert_eq!(Amount::from(255).split(), amounts);
    }

    #[test]
    fn test_checked_arithmetic() {
        assert!(Amount::from(u64::MAX).checked_add(Amount::ONE).is_err());
        assert!(Amount::ZERO.checked_sub(Amount::ONE).is_err());
        assert_eq!(
            Amount::from(5).checked_add(Amount::from(7)).unwrap(),
            Amount::from(12)
        );
        assert!(Amount::try_sum([Amount::from(u64::MAX), Amount::ONE]).is_err());
    }

    #[test]
    fn test_money_round_trip() {
        let money = Money::new(Amount::from(1000), Currency::Usd);
        let json = serde_json::to_string(&money).unwrap();
        assert_eq!(json, r#"{"amount":1000,"currency":"USD","unit":"cent"}"#);
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, money);
    }

    #[test]
    fn test_money_currency_mismatch() {
        let btc = Money::new(Amount::from(1), Currency::Btc);
        let usd = Money::new(Amount::from(1), Currency::Usd);
        assert!(btc.checked_add(usd).is_err());
        assert!(btc.partial_cmp(&usd).is_none());
    }
}
