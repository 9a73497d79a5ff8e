//! Deterministic stand-ins for the cryptographic collaborators.
//!
//! The fake exchange does no real cryptography. Channel packets carry a
//! 16-byte token derived from both keys followed by the plain inner packet.
//! Handshakes are addressed by a token derived from the recipient's key and
//! carry `at` and a numeric `session` in their inner JSON.
//!
//! [`FakePeer`] plays the remote side of a link so tests can craft inbound
//! frames and read what the local mesh sent back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use telehash_core::cloak::decloak;
use telehash_core::constants::{HANDSHAKE_TYPE_LINK, TOKEN_LENGTH};
use telehash_core::hashname::intermediates_json;
use telehash_core::{Csid, Hashname, Head, Keys, Packet, PacketError, Path, Token};
use telehash_transport::Pipe;
use telehash_transport::testing::MemoryPipe;

use crate::error::ExchangeError;
use crate::exchange::{Exchange, HandshakeOptions, LocalIdentity};
use crate::extension::{Bouncer, OpenHandler, OpenRequest, PathResolver};
use crate::link::Link;
use crate::mesh::Mesh;

/// Cipher suite used by the fakes.
pub const FAKE_CSID: Csid = Csid(0x1a);

/// Unwrap a `json!` object literal.
pub fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn pair_token(first: &[u8], second: &[u8]) -> Token {
    let mut material = first.to_vec();
    material.extend_from_slice(second);
    Token::derive(&material)
}

fn seal_handshake(csid: Csid, to_key: &[u8], inner: &Packet) -> Result<Packet, PacketError> {
    let mut body = Token::derive(to_key).as_ref().to_vec();
    body.extend_from_slice(&inner.encode()?);
    Ok(Packet::handshake(csid, body))
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Local identity holding one fake key per cipher suite.
///
/// Keeps every exchange it creates so tests can inspect them.
pub struct FakeIdentity {
    keys: Keys,
    hashname: Hashname,
    exchanges: Mutex<Vec<Arc<FakeExchange>>>,
}

impl FakeIdentity {
    /// Identity with a single [`FAKE_CSID`] key of 32 `seed` bytes.
    pub fn new(seed: u8) -> Arc<Self> {
        let keys: Keys = [(FAKE_CSID, vec![seed; 32])].into_iter().collect();
        Self::with_keys(keys)
    }

    /// Identity over an arbitrary key set. An empty set gets an all-zero hashname.
    pub fn with_keys(keys: Keys) -> Arc<Self> {
        let hashname = Hashname::from_keys(&keys).unwrap_or(Hashname::new([0; 32]));
        Arc::new(Self {
            keys,
            hashname,
            exchanges: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn key(&self, csid: Csid) -> Option<&[u8]> {
        self.keys.get(csid)
    }

    /// Exchanges created so far, oldest first.
    pub fn exchanges(&self) -> Vec<Arc<FakeExchange>> {
        self.exchanges.lock().clone()
    }

    /// The exchange created toward `remote_key`.
    pub fn exchange_with(&self, remote_key: &[u8]) -> Option<Arc<FakeExchange>> {
        self.exchanges
            .lock()
            .iter()
            .find(|exchange| exchange.remote_key == remote_key)
            .cloned()
    }
}

#[async_trait]
impl LocalIdentity for FakeIdentity {
    fn hashname(&self) -> Hashname {
        self.hashname
    }

    fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn decrypt(&self, handshake: &Packet) -> Result<Packet, ExchangeError> {
        let csid = match &handshake.head {
            Head::Binary(head) if head.len() == 1 => Csid(head[0]),
            _ => return Err(ExchangeError::Malformed("not a handshake".into())),
        };
        let key = self
            .keys
            .get(csid)
            .ok_or(ExchangeError::UnsupportedCipherSuite(csid))?;
        let addressed = handshake
            .body
            .get(..TOKEN_LENGTH)
            .ok_or(ExchangeError::DecryptFailed)?;
        if addressed != Token::derive(key).as_ref() {
            return Err(ExchangeError::DecryptFailed);
        }
        Packet::decode(&handshake.body[TOKEN_LENGTH..]).map_err(|_| ExchangeError::DecryptFailed)
    }

    fn create_exchange(&self, csid: Csid, key: &[u8]) -> Result<Arc<dyn Exchange>, ExchangeError> {
        let local = self
            .keys
            .get(csid)
            .ok_or(ExchangeError::UnsupportedCipherSuite(csid))?;
        let exchange = Arc::new(FakeExchange::new(csid, local.to_vec(), key.to_vec()));
        self.exchanges.lock().push(exchange.clone());
        Ok(exchange)
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Exchange between `local_key` and `remote_key`.
pub struct FakeExchange {
    csid: Csid,
    local_key: Vec<u8>,
    remote_key: Vec<u8>,
    session: u64,
    at: AtomicU32,
    remote_session: Mutex<Option<Token>>,
    flushes: AtomicUsize,
    next_channel: AtomicU32,
}

impl FakeExchange {
    pub fn new(csid: Csid, local_key: Vec<u8>, remote_key: Vec<u8>) -> Self {
        Self {
            csid,
            local_key,
            remote_key,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            at: AtomicU32::new(1),
            remote_session: Mutex::new(None),
            flushes: AtomicUsize::new(0),
            next_channel: AtomicU32::new(1),
        }
    }

    /// Session id this side advertises in its handshakes.
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Token of the session identified by `session`.
    pub fn session_token_of(session: u64) -> Token {
        Token::derive(&session.to_be_bytes())
    }

    fn seal(&self, inner: &Packet) -> Result<Packet, ExchangeError> {
        let mut body = pair_token(&self.local_key, &self.remote_key).as_ref().to_vec();
        body.extend_from_slice(
            &inner
                .encode()
                .map_err(|e| ExchangeError::Malformed(e.to_string()))?,
        );
        Ok(Packet::channel(body))
    }

    fn open(&self, outer: &Packet) -> Result<Packet, ExchangeError> {
        let token = outer
            .body
            .get(..TOKEN_LENGTH)
            .ok_or(ExchangeError::DecryptFailed)?;
        if token != self.token().as_ref() {
            return Err(ExchangeError::DecryptFailed);
        }
        Packet::decode(&outer.body[TOKEN_LENGTH..]).map_err(|_| ExchangeError::DecryptFailed)
    }

    fn build_handshake(&self, options: HandshakeOptions) -> Result<Packet, ExchangeError> {
        let mut json = options.json;
        json.insert("at".into(), Value::from(self.at()));
        json.insert("session".into(), Value::from(self.session));
        let inner = Packet::with_json(json, options.body);
        seal_handshake(self.csid, &self.remote_key, &inner)
            .map_err(|e| ExchangeError::HandshakeFailed(e.to_string()))
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    fn csid(&self) -> Csid {
        self.csid
    }

    fn token(&self) -> Token {
        pair_token(&self.remote_key, &self.local_key)
    }

    fn at(&self) -> u32 {
        self.at.load(Ordering::SeqCst)
    }

    fn set_at(&self, at: u32) {
        self.at.store(at, Ordering::SeqCst);
    }

    fn session_token(&self) -> Option<Token> {
        *self.remote_session.lock()
    }

    async fn encrypt(&self, inner: &Packet) -> Result<Packet, ExchangeError> {
        self.seal(inner)
    }

    async fn decrypt(&self, outer: &Packet) -> Result<Packet, ExchangeError> {
        self.open(outer)
    }

    async fn handshake(&self, options: HandshakeOptions) -> Result<Packet, ExchangeError> {
        self.build_handshake(options)
    }

    /// An older `at` is stale and changes nothing. A newer one is adopted
    /// but still out of sync, so the receiver answers with the adopted
    /// counter. Only an equal `at` is in sync.
    async fn sync(&self, _outer: &Packet, inner: &Packet) -> Result<bool, ExchangeError> {
        let remote_at = inner
            .json_u32("at")
            .ok_or_else(|| ExchangeError::HandshakeFailed("missing at".into()))?;
        let session = inner
            .json()
            .and_then(|json| json.get("session"))
            .and_then(Value::as_u64)
            .ok_or_else(|| ExchangeError::HandshakeFailed("missing session".into()))?;

        let local_at = self.at();
        if remote_at < local_at {
            return Ok(false);
        }
        self.set_at(remote_at);
        *self.remote_session.lock() = Some(Self::session_token_of(session));
        Ok(remote_at == local_at)
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn next_channel_id(&self) -> u32 {
        self.next_channel.fetch_add(1, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Remote peer
// ---------------------------------------------------------------------------

/// The far end of a link, for crafting inbound frames.
pub struct FakePeer {
    identity: Arc<FakeIdentity>,
    exchange: FakeExchange,
}

impl FakePeer {
    /// Peer with key seed `seed` talking to `local`.
    pub fn new(seed: u8, local: &FakeIdentity) -> Self {
        let identity = FakeIdentity::new(seed);
        let exchange = FakeExchange::new(
            FAKE_CSID,
            vec![seed; 32],
            local.key(FAKE_CSID).map(<[u8]>::to_vec).unwrap_or_default(),
        );
        Self { identity, exchange }
    }

    pub fn hashname(&self) -> Hashname {
        self.identity.hashname()
    }

    #[must_use]
    pub fn keys(&self) -> Keys {
        self.identity.keys().clone()
    }

    #[must_use]
    pub fn exchange(&self) -> &FakeExchange {
        &self.exchange
    }

    /// Same identity, fresh session, as after a restart.
    #[must_use]
    pub fn restarted(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            exchange: FakeExchange::new(
                FAKE_CSID,
                self.exchange.local_key.clone(),
                self.exchange.remote_key.clone(),
            ),
        }
    }

    /// Token the local side's exchange will index this peer under.
    pub fn link_token(&self) -> Token {
        pair_token(&self.exchange.local_key, &self.exchange.remote_key)
    }

    /// Handshake packet carrying freshness counter `at`.
    pub fn handshake(&self, at: u32) -> Packet {
        self.exchange.set_at(at);
        let keys = self.identity.keys();
        let key = keys.get(FAKE_CSID).map(<[u8]>::to_vec).unwrap_or_default();
        let body = Packet::with_json(intermediates_json(&keys.intermediates(), Some(FAKE_CSID)), key)
            .encode()
            .unwrap_or_default();
        let json = json_map(serde_json::json!({ "type": HANDSHAKE_TYPE_LINK }));
        self.exchange
            .build_handshake(HandshakeOptions { json, body })
            .unwrap_or_else(|_| Packet::empty())
    }

    pub fn handshake_frame(&self, at: u32) -> Vec<u8> {
        self.handshake(at).encode().unwrap_or_default()
    }

    /// Encrypted channel frame carrying `json` and `body`.
    pub fn channel_frame(&self, json: Value, body: Vec<u8>) -> Vec<u8> {
        self.exchange
            .seal(&Packet::with_json(json_map(json), body))
            .and_then(|packet| packet.encode().map_err(|e| ExchangeError::Malformed(e.to_string())))
            .unwrap_or_default()
    }

    /// Channel open of type `kind` on channel `c`.
    pub fn open_frame(&self, c: u32, kind: &str) -> Vec<u8> {
        self.channel_frame(serde_json::json!({ "type": kind, "c": c }), Vec::new())
    }

    /// Decode a frame the local mesh sent to this peer.
    ///
    /// Channel packets are decrypted; handshakes yield their inner packet.
    pub fn read(&self, frame: &[u8]) -> Option<Packet> {
        let outer = Packet::decode(&decloak(frame).0).ok()?;
        match &outer.head {
            Head::Empty if outer.body.is_empty() => Some(outer),
            Head::Empty => self.exchange.open(&outer).ok(),
            Head::Binary(_) => Packet::decode(outer.body.get(TOKEN_LENGTH..)?).ok(),
            Head::Json(_) => Some(outer),
        }
    }

    /// Every frame on `pipe` this peer can read.
    pub fn read_all(&self, pipe: &MemoryPipe) -> Vec<Packet> {
        pipe.sent_frames()
            .iter()
            .filter_map(|frame| self.read(frame))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// Resolver that builds a [`MemoryPipe`] for every path of one type.
pub struct MemoryResolver {
    kind: String,
    created: Mutex<Vec<Arc<MemoryPipe>>>,
}

impl MemoryResolver {
    pub fn new(kind: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.into(),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<MemoryPipe>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PathResolver for MemoryResolver {
    async fn pipe(&self, _link: &Link, path: &Path) -> Option<Arc<dyn Pipe>> {
        if path.kind != self.kind {
            return None;
        }
        let pipe = MemoryPipe::new(path.clone());
        self.created.lock().push(pipe.clone());
        Some(pipe as Arc<dyn Pipe>)
    }
}

/// Open handler that records requests, then accepts the channel or bounces.
pub struct RecordingHandler {
    bounce: Option<String>,
    opened: Mutex<Vec<OpenRequest>>,
}

impl RecordingHandler {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            bounce: None,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn bouncing(err: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            bounce: Some(err.into()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<OpenRequest> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl OpenHandler for RecordingHandler {
    async fn open(&self, link: Arc<Link>, request: OpenRequest, bouncer: Bouncer) {
        self.opened.lock().push(request.clone());
        match &self.bounce {
            Some(err) => {
                let _ = bouncer.bounce(err).await;
            }
            None => {
                link.accept_channel(&request);
            }
        }
    }
}

/// Mesh over [`FakeIdentity::new`]`(seed)` with default settings.
pub fn fake_mesh(seed: u8) -> (Arc<Mesh>, Arc<FakeIdentity>) {
    let identity = FakeIdentity::new(seed);
    let mesh = Mesh::builder(identity.clone()).build();
    (mesh, identity)
}
