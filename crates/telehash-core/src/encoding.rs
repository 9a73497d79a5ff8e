//! Unpadded lowercase base32 (RFC 4648 alphabet).
//!
//! Hashnames and public keys travel as base32 text in JSON heads and
//! configuration files.

use crate::error::HashnameError;

const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Encode bytes as unpadded lowercase base32.
#[must_use]
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn decode_char(c: char) -> Result<u32, HashnameError> {
    match c {
        'a'..='z' => Ok(c as u32 - 'a' as u32),
        'A'..='Z' => Ok(c as u32 - 'A' as u32),
        '2'..='7' => Ok(c as u32 - '2' as u32 + 26),
        other => Err(HashnameError::InvalidBase32(other)),
    }
}

/// Decode unpadded base32, case-insensitively. Trailing `=` padding is tolerated.
pub fn base32_decode(text: &str) -> Result<Vec<u8>, HashnameError> {
    let trimmed = text.trim_end_matches('=');
    let mut out = Vec::with_capacity(trimmed.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for c in trimmed.chars() {
        buffer = (buffer << 5) | decode_char(c)?;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
        buffer &= (1 << bits) - 1;
    }
    Ok(out)
}
