//! Hex encoding and decoding

use thiserror::Error;

/// Hex error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Character is not part of the hex alphabet
    #[error("Invalid hex character `{0}`")]
    InvalidCharacter(char),
    /// Input has an odd number of characters
    #[error("Odd number of hex digits")]
    OddLength,
}

/// Encode bytes as a lowercase hex string
pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
    let bytes = data.as_ref();
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

/// Decode a hex string into bytes
pub fn decode<T: AsRef<[u8]>>(hex: T) -> Result<Vec<u8>, Error> {
    let hex = hex.as_ref();

    if hex.len() % 2 != 0 {
        return Err(Error::OddLength);
    }

    let digit = |c: u8| -> Result<u8, Error> {
        (c as char)
            .to_digit(16)
            .map(|d| d as u8)
            .ok_or(Error::InvalidCharacter(c as char))
    };

    hex.chunks(2)
        .map(|pair| Ok(digit(pair[0])? << 4 | digit(pair[1])?))
        .collect()
}
