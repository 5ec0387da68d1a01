//! Input fee calculation

use agicash_common::proof::Proofs;
use agicash_common::{Amount, Error};

use crate::mint::MintService;

/// Fee for spending `input_count` proofs at `fee_ppk` parts-per-thousand
/// per proof, rounded up to the next whole unit.
pub fn input_fee(input_count: usize, fee_ppk: u64) -> Amount {
    let sum_ppk = fee_ppk * input_count as u64;
    Amount::from((sum_ppk + 999) / 1000)
}

/// Fee for spending a proof set that may span keysets. Summed in ppk
/// across all inputs and rounded up once.
pub fn proofs_fee(service: &MintService, proofs: &Proofs) -> Result<Amount, Error> {
    let mut sum_ppk = 0u64;
    for proof in proofs {
        sum_ppk += service.input_fee_ppk(&proof.keyset_id)?;
    }
    Ok(Amount::from((sum_ppk + 999) / 1000))
}
