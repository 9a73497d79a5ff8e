//! Newtype wrappers for identifiers that share a byte representation.
//!
//! Tokens, fingerprints and cipher-suite ids are all "just bytes" on the
//! wire; wrapping them keeps a route token from being used as a link index
//! key by accident.

use core::fmt;

use sha2::{Digest, Sha256};

use crate::constants::TOKEN_LENGTH;

/// Helper to write lowercase hex without allocating.
fn fmt_hex(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Error returned when a byte slice has the wrong length for a fixed-size type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid length: expected {expected}, got {actual}")]
pub struct InvalidLength {
    pub expected: usize,
    pub actual: usize,
}

/// A 16-byte lookup key for a link or a relay route.
///
/// For channel traffic the token is the first 16 bytes of the packet body.
/// For handshakes the relay token is derived by hashing those bytes, see
/// [`Token::handshake_route`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct Token(pub(crate) [u8; TOKEN_LENGTH]);

impl Token {
    pub const fn new(bytes: [u8; TOKEN_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Token of a channel packet: the leading 16 bytes of its body.
    ///
    /// Returns `None` when the body is shorter than a token.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let bytes: [u8; TOKEN_LENGTH] = body.get(..TOKEN_LENGTH)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Route token of a handshake: `sha256(body[0..16])[0..16]`.
    pub fn handshake_route(body: &[u8]) -> Option<Self> {
        let head = body.get(..TOKEN_LENGTH)?;
        let digest: [u8; 32] = Sha256::digest(head).into();
        let mut bytes = [0u8; TOKEN_LENGTH];
        bytes.copy_from_slice(&digest[..TOKEN_LENGTH]);
        Some(Self(bytes))
    }

    /// Derive a token by hashing arbitrary material and truncating.
    pub fn derive(material: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(material).into();
        let mut bytes = [0u8; TOKEN_LENGTH];
        bytes.copy_from_slice(&digest[..TOKEN_LENGTH]);
        Self(bytes)
    }

    /// Lowercase hex representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Token {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; TOKEN_LENGTH] = bytes.try_into().map_err(|_| InvalidLength {
            expected: TOKEN_LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(&self.0, f)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(")?;
        fmt_hex(&self.0[..4], f)?;
        write!(f, "..)")
    }
}

/// SHA-256 over a complete encoded packet, used to suppress relay loops.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct Fingerprint(pub(crate) [u8; 32]);

impl Fingerprint {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of the given encoded packet bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        fmt_hex(&self.0[..4], f)?;
        write!(f, "..)")
    }
}

/// Cipher-suite identifier, written as two hex digits (`"1a"`, `"2a"`, `"3a"`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Csid(pub u8);

impl Csid {
    /// Parse the two-hex-digit form used as JSON keys.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 2 {
            return None;
        }
        u8::from_str_radix(s, 16).ok().map(Self)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("{:02x}", self.0)
    }
}

impl fmt::Display for Csid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

impl fmt::Debug for Csid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csid({:02x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_body_takes_prefix() {
        let body: Vec<u8> = (0u8..40).collect();
        let token = Token::from_body(&body).unwrap();
        assert_eq!(token.as_ref(), &body[..16]);
    }

    #[test]
    fn test_token_from_short_body_is_none() {
        assert!(Token::from_body(&[0u8; 15]).is_none());
        assert!(Token::handshake_route(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_handshake_route_hashes_prefix_only() {
        let mut a = vec![7u8; 16];
        let mut b = a.clone();
        a.extend_from_slice(b"tail one");
        b.extend_from_slice(b"a different tail");
        assert_eq!(Token::handshake_route(&a), Token::handshake_route(&b));
        assert_ne!(Token::handshake_route(&a), Token::from_body(&a));
    }

    #[test]
    fn test_token_display_is_hex() {
        let token = Token::new([0xab; 16]);
        assert_eq!(token.to_string(), "ab".repeat(16));
        assert_eq!(format!("{token:?}"), "Token(abababab..)");
    }

    #[test]
    fn test_token_try_from_wrong_length() {
        let err = Token::try_from(&[1u8, 2, 3][..]).unwrap_err();
        assert_eq!(err, InvalidLength { expected: 16, actual: 3 });
    }

    #[test]
    fn test_fingerprint_differs_by_content() {
        assert_eq!(Fingerprint::of(b"abc"), Fingerprint::of(b"abc"));
        assert_ne!(Fingerprint::of(b"abc"), Fingerprint::of(b"abd"));
    }

    #[test]
    fn test_csid_hex() {
        assert_eq!(Csid::from_hex("1a"), Some(Csid(0x1a)));
        assert_eq!(Csid(0x3a).to_hex(), "3a");
        assert!(Csid::from_hex("1").is_none());
        assert!(Csid::from_hex("zz").is_none());
    }
}
