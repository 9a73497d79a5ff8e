//! Cryptographic collaborators consumed by links and the dispatcher.
//!
//! The byte-level handshake and encryption algorithms live behind these
//! traits. Implementations must serialize their own operations: a link may
//! call `decrypt` and `sync` from concurrently processed packets.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use telehash_core::{Csid, Hashname, Keys, Packet, Token};

use crate::error::ExchangeError;

/// Payload a link hands to [`Exchange::handshake`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeOptions {
    pub json: Map<String, Value>,
    pub body: Vec<u8>,
}

/// Per-link cryptographic session.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn csid(&self) -> Csid;

    /// Token the peer places in the first 16 bytes of channel packets it sends us.
    fn token(&self) -> Token;

    /// Current freshness counter.
    fn at(&self) -> u32;

    /// Force the freshness counter to `at`.
    fn set_at(&self, at: u32);

    /// Token of the current session, `None` before the first handshake is synced.
    fn session_token(&self) -> Option<Token>;

    async fn encrypt(&self, inner: &Packet) -> Result<Packet, ExchangeError>;

    async fn decrypt(&self, outer: &Packet) -> Result<Packet, ExchangeError>;

    /// Build an outer handshake packet carrying `options`.
    async fn handshake(&self, options: HandshakeOptions) -> Result<Packet, ExchangeError>;

    /// Apply an inbound handshake. Returns whether the session is in sync.
    async fn sync(&self, outer: &Packet, inner: &Packet) -> Result<bool, ExchangeError>;

    /// Mark every channel as needing retransmission.
    fn flush(&self);

    /// Allocate the id of a locally opened channel.
    fn next_channel_id(&self) -> u32;
}

/// The local participant: its keys and the handshake-level crypto.
#[async_trait]
pub trait LocalIdentity: Send + Sync {
    fn hashname(&self) -> Hashname;

    fn keys(&self) -> &Keys;

    /// Best cipher suite shared with `remote`: the highest csid both sides hold.
    fn match_csid(&self, remote: &Keys) -> Option<Csid> {
        self.keys()
            .csids()
            .filter(|csid| remote.get(*csid).is_some())
            .max()
    }

    /// Open an inbound handshake addressed to us and return its inner packet.
    async fn decrypt(&self, handshake: &Packet) -> Result<Packet, ExchangeError>;

    /// Construct the exchange for a peer key of cipher suite `csid`.
    fn create_exchange(&self, csid: Csid, key: &[u8]) -> Result<Arc<dyn Exchange>, ExchangeError>;
}
