//! bolt11 invoice helpers

use std::str::FromStr;

use agicash_common::util::hex;
use agicash_common::{Amount, Error};
use lightning_invoice::Bolt11Invoice;

/// Payment hash of a bolt11 invoice, hex
pub fn payment_hash(payment_request: &str) -> Result<String, Error> {
    let invoice = parse(payment_request)?;
    Ok(hex::encode(invoice.payment_hash()))
}

/// Amount of a bolt11 invoice in sats
pub fn amount_sats(payment_request: &str) -> Result<Amount, Error> {
    let invoice = parse(payment_request)?;
    let msats = invoice
        .amount_milli_satoshis()
        .ok_or_else(|| Error::Custom("amountless invoice".to_string()))?;
    Ok(Amount::from(msats / 1000))
}

fn parse(payment_request: &str) -> Result<Bolt11Invoice, Error> {
    Bolt11Invoice::from_str(payment_request)
        .map_err(|e| Error::Custom(format!("invalid bolt11 invoice: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_invoice;

    #[test]
    fn extracts_hash_and_amount() {
        let (request, hash) = fake_invoice(70_000, "test".to_string());
        assert_eq!(payment_hash(&request).unwrap(), hash);
        assert_eq!(amount_sats(&request).unwrap(), Amount::from(70));
    }

    #[test]
    fn rejects_garbage() {
        assert!(payment_hash("lnbc-not-an-invoice").is_err());
    }
}
