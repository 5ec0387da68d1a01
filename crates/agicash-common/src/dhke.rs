//! Blinded Diffie-Hellman key exchange
//!
//! The wallet half of the Cashu BDHKE: blinding of secrets before they
//! are sent to the mint, unblinding of the mint's signatures, and the
//! `hash_to_curve` map that yields a proof's public identity Y.

use bitcoin::hashes::sha256::Hash as Sha256Hash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Parity, PublicKey, Scalar, SecretKey, XOnlyPublicKey};
use thiserror::Error;

use crate::keyset::Keys;
use crate::proof::{BlindSignature, Proof, Proofs};
use crate::secret::Secret;
use crate::util::hex;
use crate::SECP256K1;

const DOMAIN_SEPARATOR: &[u8; 28] = b"Secp256k1_HashToCurve_Cashu_";

/// DHKE error
#[derive(Debug, Error)]
pub enum Error {
    /// No valid point found within the search bound
    #[error("No valid point on curve")]
    NoValidPoint,
    /// Mint did not publish a key for the amount
    #[error("No key for amount")]
    AmountKey,
    /// Secp256k1 error
    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
}

/// Map a message to a point on the curve.
///
/// The result for a proof secret is the proof's public identity `Y`,
/// the mint-side unique key of the proof.
pub fn hash_to_curve(message: &[u8]) -> Result<PublicKey, Error> {
    let msg_to_hash: Vec<u8> = [DOMAIN_SEPARATOR, message].concat();
    let msg_hash: [u8; 32] = Sha256Hash::hash(&msg_to_hash).to_byte_array();

    let mut counter: u32 = 0;
    while counter < 2_u32.pow(16) {
        let mut bytes_to_hash: Vec<u8> = Vec::with_capacity(36);
        bytes_to_hash.extend_from_slice(&msg_hash);
        bytes_to_hash.extend_from_slice(&counter.to_le_bytes());
        let hash: [u8; 32] = Sha256Hash::hash(&bytes_to_hash).to_byte_array();

        match XOnlyPublicKey::from_slice(&hash) {
            Ok(pk) => return Ok(PublicKey::from_x_only_public_key(pk, Parity::Even)),
            Err(_) => {
                counter += 1;
            }
        }
    }

    Err(Error::NoValidPoint)
}

/// Blind a message: `B_ = Y + rG`
pub fn blind_message(
    secret: &[u8],
    blinding_factor: &SecretKey,
) -> Result<(PublicKey, SecretKey), Error> {
    let y = hash_to_curve(secret)?;
    let r = *blinding_factor;
    Ok((y.combine(&r.public_key(&SECP256K1))?, r))
}

/// Unblind a mint signature: `C = C_ - rK`
pub fn unblind_message(
    // C_
    blinded_key: &PublicKey,
    r: &SecretKey,
    // K
    mint_pubkey: &PublicKey,
) -> Result<PublicKey, Error> {
    let r = Scalar::from(*r);

    // a = r * K
    let a = mint_pubkey.mul_tweak(&SECP256K1, &r)?;

    // C_ + (-a)
    let a = a.negate(&SECP256K1);
    Ok(blinded_key.combine(&a)?)
}

/// Unblind a batch of mint signatures into proofs.
///
/// `promises`, `rs` and `secrets` must be parallel, in the order the
/// blinded messages were sent to the mint.
pub fn construct_proofs(
    promises: Vec<BlindSignature>,
    rs: Vec<SecretKey>,
    secrets: Vec<Secret>,
    keys: &Keys,
) -> Result<Proofs, Error> {
    let mut proofs = Vec::with_capacity(promises.len());
    for ((promise, r), secret) in promises.into_iter().zip(rs).zip(secrets) {
        let mint_key = keys.amount_key(promise.amount).ok_or(Error::AmountKey)?;
        let c = unblind_message(&promise.c, &r, &mint_key)?;

        proofs.push(Proof {
            amount: promise.amount,
            keyset_id: promise.keyset_id,
            secret,
            c,
        });
    }

    Ok(proofs)
}

/// Hash public keys into the DLEQ challenge
pub fn hash_e<I>(public_keys: I) -> [u8; 32]
where
    I: IntoIterator<Item = PublicKey>,
{
    let mut e = String::new();
    for public_key in public_keys {
        e.push_str(&hex::encode(public_key.serialize_uncompressed()));
    }
    Sha256Hash::hash(e.as_bytes()).to_byte_array()
}

/// Verify a DLEQ proof `(e, s)` for a blind signature.
///
/// Checks `e == hash(R1, R2, K, C_)` with `R1 = sG - eK` and
/// `R2 = sB_ - eC_`, proving the mint used the key `K` it published.
pub fn verify_dleq(
    // B_
    blinded_message: &PublicKey,
    // C_
    blinded_signature: &PublicKey,
    e: &SecretKey,
    s: &SecretKey,
    mint_pubkey: &PublicKey,
) -> Result<bool, Error> {
    let e_scalar = Scalar::from(*e);

    // R1 = sG - eK
    let s_g = s.public_key(&SECP256K1);
    let e_k = mint_pubkey
        .mul_tweak(&SECP256K1, &e_scalar)?
        .negate(&SECP256K1);
    let r1 = s_g.combine(&e_k)?;

    // R2 = sB_ - eC_
    let s_b = blinded_message.mul_tweak(&SECP256K1, &Scalar::from(*s))?;
    let e_c = blinded_signature
        .mul_tweak(&SECP256K1, &e_scalar)?
        .negate(&SECP256K1);
    let r2 = s_b.combine(&e_c)?;

    let challenge = hash_e([r1, r2, *mint_pubkey, *blinded_signature]);
    Ok(challenge == e.secret_bytes())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_hash_to_curve() {
        let secret = "0000000000000000000000000000000000000000000000000000000000000000";
        let y = hash_to_curve(&hex::decode(secret).unwrap()).unwrap();
        assert_eq!(
            hex::encode(y.serialize()),
            "02c03ade6f7345a213ea11acde3fda8514f2b7d836a32dfac38f9596c07258f9a9"
        );

        let secret = "0000000000000000000000000000000000000000000000000000000000000001";
        let y = hash_to_curve(&hex::decode(secret).unwrap()).unwrap();
        assert_eq!(
            hex::encode(y.serialize()),
            "02a5525df57a880f880f28903f32b421df848b3dc1d2cf0bf3d718d7bd772c2df9"
        );

        // Takes a few iterations of the loop before finding a valid point
        let secret = "0000000000000000000000000000000000000000000000000000000000000002";
        let y = hash_to_curve(&hex::decode(secret).unwrap()).unwrap();
        assert_eq!(
            hex::encode(y.serialize()),
            "0277834447374a42908b34940dc2affc5f0fc4bbddb2e3b209c5c0b18438abf764"
        );
    }

    #[test]
    fn test_blind_message() {
        let message = "d341ee4871f1f889041e63cf0d3823c713eea6aff01e80f1719f08f9e5be98f6";
        let sec = SecretKey::from_str(
            "99fce58439fc37412ab3468b73db0569322588f62fb3a49182d67e23d877824a",
        )
        .unwrap();

        let (b, r) = blind_message(&hex::decode(message).unwrap(), &sec).unwrap();

        assert_eq!(sec, r);
        assert_eq!(
            hex::encode(b.serialize()),
            "03039eb7fb76a0db827d7b978a508e3319db03cde6ca8744ef32d0b4e4f455f5dc"
        );
    }

    #[test]
    fn test_blind_unblind_round_trip() {
        // A mint signing key and the derived public key
        let a = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let mint_pubkey = a.public_key(&SECP256K1);

        let secret = Secret::generate();
        let r = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let (blinded, r) = blind_message(secret.as_bytes(), &r).unwrap();

        // Mint side: C_ = a * B_
        let signed = blinded
            .mul_tweak(&SECP256K1, &Scalar::from(a))
            .unwrap();

        let c = unblind_message(&signed, &r, &mint_pubkey).unwrap();

        // C should equal a * Y
        let y = hash_to_curve(secret.as_bytes()).unwrap();
        let expected = y.mul_tweak(&SECP256K1, &Scalar::from(a)).unwrap();
        assert_eq!(c, expected);
    }
}
