//! Error types for the telehash-core crate.

use crate::types::Csid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },

    #[error("head length {declared} exceeds available {available} bytes")]
    HeadOverflow { declared: usize, available: usize },

    #[error("head of {0} bytes does not fit the length prefix")]
    HeadTooLong(usize),

    #[error("invalid json head: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashnameError {
    #[error("invalid hashname length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid base32 character: {0:?}")]
    InvalidBase32(char),

    #[error("no keys or intermediates to derive a hashname from")]
    Empty,

    #[error("missing key for csid {0}")]
    MissingKey(Csid),

    #[error("invalid intermediate for csid {0}")]
    InvalidIntermediate(Csid),

    #[error("invalid key encoding for csid {0}")]
    InvalidKey(Csid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_error_display() {
        let err = PacketError::TooShort { min: 2, actual: 1 };
        assert_eq!(
            err.to_string(),
            "packet too short: need at least 2 bytes, got 1"
        );

        let err = PacketError::HeadOverflow {
            declared: 40,
            available: 3,
        };
        assert_eq!(err.to_string(), "head length 40 exceeds available 3 bytes");
    }

    #[test]
    fn test_hashname_error_display() {
        let err = HashnameError::MissingKey(Csid(0x1a));
        assert_eq!(err.to_string(), "missing key for csid 1a");

        let err = HashnameError::InvalidBase32('!');
        assert_eq!(err.to_string(), "invalid base32 character: '!'");
    }
}
