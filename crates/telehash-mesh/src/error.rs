//! Error types for links, exchanges and the mesh context.

use telehash_core::{Csid, Hashname, HashnameError, PacketError};
use telehash_transport::TransportError;

/// Failures reported by an [`Exchange`](crate::exchange::Exchange) or the local identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("decryption failed")]
    DecryptFailed,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unsupported cipher suite {0}")]
    UnsupportedCipherSuite(Csid),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Errors that can occur while driving links and channels.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("invalid link arguments: {0}")]
    InvalidArgs(String),

    #[error("refusing to link to ourselves")]
    SelfLink,

    #[error("no exchange for {0}")]
    NoExchange(Hashname),

    #[error("no pipes for {0}")]
    NoPipes(Hashname),

    #[error("channel {0} is gone")]
    ChannelGone(u32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("hashname error: {0}")]
    Hashname(#[from] HashnameError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_display() {
        assert_eq!(ExchangeError::DecryptFailed.to_string(), "decryption failed");
        assert_eq!(
            ExchangeError::UnsupportedCipherSuite(Csid(0x3a)).to_string(),
            "unsupported cipher suite 3a"
        );
    }

    #[test]
    fn test_mesh_error_display() {
        assert_eq!(MeshError::SelfLink.to_string(), "refusing to link to ourselves");
        assert_eq!(MeshError::ChannelGone(7).to_string(), "channel 7 is gone");
        let err = MeshError::Config("bad toml".into());
        assert_eq!(err.to_string(), "configuration error: bad toml");
    }

    #[test]
    fn test_mesh_error_from_lower_layers() {
        let err: MeshError = ExchangeError::DecryptFailed.into();
        assert!(matches!(err, MeshError::Exchange(ExchangeError::DecryptFailed)));

        let err: MeshError = TransportError::NotConnected.into();
        assert!(err.to_string().contains("pipe not connected"));
    }
}
