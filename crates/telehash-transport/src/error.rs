//! Transport layer error types.

use telehash_core::PacketError;

/// Errors surfaced through a pipe send completion.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("pipe not connected")]
    NotConnected,

    #[error("pipe closed")]
    Closed,

    #[error("transmit failed: {0}")]
    TransmitFailed(String),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::NotConnected.to_string(), "pipe not connected");
        assert_eq!(TransportError::Closed.to_string(), "pipe closed");

        let err = TransportError::TransmitFailed("buffer full".into());
        assert_eq!(err.to_string(), "transmit failed: buffer full");
    }

    #[test]
    fn test_transport_error_from_packet_error() {
        let err: TransportError = PacketError::HeadTooLong(70_000).into();
        assert!(matches!(err, TransportError::Packet(_)));
        assert!(err.to_string().contains("70000"));
    }
}
