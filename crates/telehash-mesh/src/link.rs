//! Links: one per remote hashname.
//!
//! A link owns an ordered set of pipes (best first), at most one exchange,
//! and the channels running inside that exchange. It drives the handshake
//! and resync protocol that keeps pipe ranking current.
//!
//! State lives behind a single `parking_lot` mutex that is never held across
//! an await. Sends are spawned and never block the caller.

use core::fmt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use telehash_core::constants::HANDSHAKE_TYPE_LINK;
use telehash_core::hashname::intermediates_json;
use telehash_core::{Csid, Hashname, Keys, Packet, Path, Token};
use telehash_transport::{LivenessObserver, Pipe, PipeEvent, PipeId, SubscriptionId, same_path};

use crate::channel::Channel;
use crate::error::MeshError;
use crate::exchange::{Exchange, HandshakeOptions};
use crate::extension::OpenRequest;
use crate::mesh::{Mesh, MeshEvent};
use crate::ranking::rank_by;

/// Ids of ended channels remembered per link, so late traffic to them is dropped.
const RETIRED_CHANNELS: usize = 256;

/// Link state. Any down state carries its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Init,
    Up,
    Down(String),
}

impl LinkStatus {
    #[must_use]
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Down(_))
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Up => write!(f, "up"),
            Self::Down(reason) => write!(f, "down: {reason}"),
        }
    }
}

/// Events published on a link's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Status(LinkStatus),
    Down(String),
}

/// Status-change callback registered with [`Link::on_status`].
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, link: &Link, status: &LinkStatus);
}

impl<F> StatusObserver for F
where
    F: Fn(&Link, &LinkStatus) + Send + Sync,
{
    fn on_status(&self, link: &Link, status: &LinkStatus) {
        self(link, status)
    }
}

/// Run `task` on the current runtime, logging instead of panicking without one.
pub(crate) fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => tracing::warn!("no async runtime, background task dropped"),
    }
}

struct LinkInner {
    status: LinkStatus,
    pipes: Vec<Arc<dyn Pipe>>,
    subscriptions: HashMap<PipeId, SubscriptionId>,
    seen: HashMap<PipeId, Instant>,
    down: HashSet<PipeId>,
    synced_at: Instant,
    paths: Vec<Path>,
    keys: Keys,
    csid: Option<Csid>,
    sid: Option<Token>,
    exchange_failed: bool,
    channels: HashMap<u32, Arc<Channel>>,
    retired: VecDeque<u32>,
    observers: Vec<Arc<dyn StatusObserver>>,
}

impl LinkInner {
    fn rank(&mut self) {
        let seen = &self.seen;
        rank_by(&mut self.pipes, self.synced_at, |pipe| {
            seen.get(&pipe.id()).copied()
        });
    }

    fn is_fresh(&self, pipe: PipeId) -> bool {
        self.seen.get(&pipe).is_some_and(|at| *at >= self.synced_at)
    }
}

/// The session and routing state between this node and one remote hashname.
pub struct Link {
    hashname: Hashname,
    mesh: Weak<Mesh>,
    me: Weak<Link>,
    exchange: OnceLock<Arc<dyn Exchange>>,
    inner: Mutex<LinkInner>,
    events: broadcast::Sender<LinkEvent>,
}

impl Link {
    pub(crate) fn new(hashname: Hashname, mesh: &Arc<Mesh>) -> Arc<Self> {
        let (events, _) = broadcast::channel(mesh.settings().event_capacity.max(1));
        Arc::new_cyclic(|me| Self {
            hashname,
            mesh: Arc::downgrade(mesh),
            me: me.clone(),
            exchange: OnceLock::new(),
            inner: Mutex::new(LinkInner {
                status: LinkStatus::Init,
                pipes: Vec::new(),
                subscriptions: HashMap::new(),
                seen: HashMap::new(),
                down: HashSet::new(),
                synced_at: Instant::now(),
                paths: Vec::new(),
                keys: Keys::new(),
                csid: None,
                sid: None,
                exchange_failed: false,
                channels: HashMap::new(),
                retired: VecDeque::new(),
                observers: Vec::new(),
            }),
            events,
        })
    }

    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.inner.lock().status.clone()
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.inner.lock().status.is_up()
    }

    #[must_use]
    pub fn exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.exchange.get().cloned()
    }

    #[must_use]
    pub fn csid(&self) -> Option<Csid> {
        self.inner.lock().csid
    }

    #[must_use]
    pub fn keys(&self) -> Keys {
        self.inner.lock().keys.clone()
    }

    /// Advertised paths, in the order they were learned.
    #[must_use]
    pub fn paths(&self) -> Vec<Path> {
        self.inner.lock().paths.clone()
    }

    /// Pipes, best first.
    #[must_use]
    pub fn pipes(&self) -> Vec<Arc<dyn Pipe>> {
        self.inner.lock().pipes.clone()
    }

    #[must_use]
    pub fn best_pipe(&self) -> Option<Arc<dyn Pipe>> {
        self.inner.lock().pipes.first().cloned()
    }

    /// Whether the registered pipe for `pipe`'s path has ever been seen.
    #[must_use]
    pub fn has_seen(&self, pipe: &dyn Pipe) -> bool {
        let inner = self.inner.lock();
        inner
            .pipes
            .iter()
            .find(|known| same_path(known.as_ref(), pipe))
            .is_some_and(|known| inner.seen.contains_key(&known.id()))
    }

    /// When the registered pipe for `pipe`'s path was last seen.
    #[must_use]
    pub fn seen_at(&self, pipe: &dyn Pipe) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .pipes
            .iter()
            .find(|known| same_path(known.as_ref(), pipe))
            .and_then(|known| inner.seen.get(&known.id()).copied())
    }

    /// Time of the last full resync.
    #[must_use]
    pub fn synced_at(&self) -> Instant {
        self.inner.lock().synced_at
    }

    /// Session token last observed from the exchange.
    #[must_use]
    pub fn sid(&self) -> Option<Token> {
        self.inner.lock().sid
    }

    #[must_use]
    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.inner.lock().channels.get(&id).cloned()
    }

    /// Live and not yet retired channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Whether `id` belongs to a channel that ended and was retired.
    #[must_use]
    pub fn is_retired(&self, id: u32) -> bool {
        self.inner.lock().retired.contains(&id)
    }

    /// Forget an ended channel, keeping its id among the most recent tombstones.
    pub(crate) fn retire_channel(&self, id: u32) {
        let mut inner = self.inner.lock();
        if inner.channels.remove(&id).is_none() {
            return;
        }
        if !inner.retired.contains(&id) {
            if inner.retired.len() == RETIRED_CHANNELS {
                inner.retired.pop_front();
            }
            inner.retired.push_back(id);
        }
        tracing::trace!(hashname = %self.hashname.short(), channel = id, "channel retired");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Identity and exchange
    // -----------------------------------------------------------------------

    /// Merge the peer's keys and pick the best common cipher suite.
    pub fn set_info(&self, keys: &Keys) -> Option<Csid> {
        let mesh = self.mesh.upgrade()?;
        let mut inner = self.inner.lock();
        inner.keys.merge(keys);
        inner.csid = mesh.identity().match_csid(&inner.keys);
        inner.csid
    }

    /// Construct the exchange once a csid and key are known.
    ///
    /// Returns `true` only for the call that created it. A failure is logged
    /// once and leaves the link inert.
    pub fn create_exchange(&self) -> bool {
        if self.exchange.get().is_some() {
            return false;
        }
        let Some(mesh) = self.mesh.upgrade() else {
            return false;
        };

        let mut inner = self.inner.lock();
        if self.exchange.get().is_some() || inner.keys.is_empty() {
            return false;
        }
        let chosen = inner
            .csid
            .and_then(|csid| inner.keys.get(csid).map(|key| (csid, key.to_vec())));
        let Some((csid, key)) = chosen else {
            if !inner.exchange_failed {
                inner.exchange_failed = true;
                tracing::warn!(hashname = %self.hashname, "no common cipher suite, link is inert");
            }
            return false;
        };

        match mesh.identity().create_exchange(csid, &key) {
            Ok(exchange) => {
                let token = exchange.token();
                if self.exchange.set(exchange).is_err() {
                    return false;
                }
                drop(inner);
                tracing::debug!(hashname = %self.hashname, %csid, %token, "exchange created");
                if let Some(link) = self.me.upgrade() {
                    mesh.index_link(token, link);
                }
                true
            }
            Err(err) => {
                if !inner.exchange_failed {
                    inner.exchange_failed = true;
                    tracing::warn!(hashname = %self.hashname, %csid, %err, "failed to create exchange, link is inert");
                }
                false
            }
        }
    }

    /// Build a handshake from the current exchange. `None` without one.
    pub async fn handshake(&self) -> Option<Packet> {
        let exchange = self.exchange()?;
        let mesh = self.mesh.upgrade()?;
        let csid = exchange.csid();

        let options = {
            let keys = mesh.identity().keys();
            let Some(key) = keys.get(csid) else {
                tracing::debug!(hashname = %self.hashname, %csid, "no local key for handshake");
                return None;
            };
            let intermediates = intermediates_json(&keys.intermediates(), Some(csid));
            let body = match Packet::with_json(intermediates, key.to_vec()).encode() {
                Ok(body) => body,
                Err(err) => {
                    tracing::debug!(%err, "failed to encode handshake body");
                    return None;
                }
            };
            let mut json = Map::new();
            json.insert("type".into(), Value::from(HANDSHAKE_TYPE_LINK));
            HandshakeOptions { json, body }
        };

        match exchange.handshake(options).await {
            Ok(packet) => Some(packet),
            Err(err) => {
                tracing::debug!(hashname = %self.hashname, %err, "handshake build failed");
                None
            }
        }
    }

    /// Send the current handshake on `pipe` in the background.
    ///
    /// With `always`, the empty packet goes out when there is no handshake
    /// yet, so the transport still sees intent to talk.
    pub(crate) fn send_handshake(&self, pipe: Arc<dyn Pipe>, always: bool) {
        let Some(link) = self.me.upgrade() else {
            return;
        };
        spawn_detached(async move {
            let packet = match link.handshake().await {
                Some(handshake) => handshake,
                None if always => Packet::empty(),
                None => return,
            };
            tracing::trace!(hashname = %link.hashname.short(), pipe = %pipe.id(), "sending handshake");
            if let Err(err) = pipe.send(&packet).await {
                tracing::debug!(hashname = %link.hashname.short(), pipe = %pipe.id(), %err, "handshake send failed");
            }
        });
    }

    /// Resync every pipe with a fresh handshake.
    ///
    /// Advances the freshness counter, restarts the seen round and fans the
    /// handshake out to all pipes in parallel without waiting for replies.
    /// Returns `false` when there is no exchange yet.
    pub fn sync(&self) -> bool {
        let Some(exchange) = self.exchange() else {
            tracing::debug!(hashname = %self.hashname.short(), "sync skipped, no exchange");
            return false;
        };
        // Bump and stamp under the lock: each sync advances `at` by exactly one.
        let (at, pipes) = {
            let mut inner = self.inner.lock();
            let at = exchange.at().saturating_add(1);
            exchange.set_at(at);
            inner.synced_at = Instant::now();
            (at, inner.pipes.clone())
        };
        tracing::debug!(
            hashname = %self.hashname.short(),
            at,
            pipes = pipes.len(),
            "link sync"
        );

        let Some(link) = self.me.upgrade() else {
            return true;
        };
        spawn_detached(async move {
            let Some(handshake) = link.handshake().await else {
                return;
            };
            for pipe in pipes {
                let handshake = handshake.clone();
                let hashname = link.hashname;
                spawn_detached(async move {
                    if let Err(err) = pipe.send(&handshake).await {
                        tracing::debug!(hashname = %hashname.short(), pipe = %pipe.id(), %err, "sync send failed");
                    }
                });
            }
        });
        true
    }

    pub(crate) fn restart_sync_round(&self) {
        self.inner.lock().synced_at = Instant::now();
    }

    /// Record the exchange's session token. Returns `true` if it changed.
    pub(crate) fn observe_session(&self, token: Option<Token>) -> bool {
        let Some(token) = token else {
            return false;
        };
        let mut inner = self.inner.lock();
        if inner.sid == Some(token) {
            return false;
        }
        inner.sid = Some(token);
        true
    }

    // -----------------------------------------------------------------------
    // Paths and pipes
    // -----------------------------------------------------------------------

    fn note_path(inner: &mut LinkInner, path: &Path) -> bool {
        if inner.paths.contains(path) {
            return false;
        }
        inner.paths.push(path.clone());
        true
    }

    /// Record a reachability hint and ask every resolver for a pipe.
    ///
    /// Returns the number of pipes added.
    pub async fn add_path(&self, path: Path) -> usize {
        if path.peer_hashname() == Some(self.hashname) {
            tracing::debug!(hashname = %self.hashname.short(), "skipping peer path to self");
            return 0;
        }
        if Self::note_path(&mut self.inner.lock(), &path) {
            tracing::debug!(hashname = %self.hashname.short(), %path, "path added");
        }

        let Some(mesh) = self.mesh.upgrade() else {
            return 0;
        };
        let mut added = 0;
        for resolver in mesh.extensions().resolvers() {
            if let Some(pipe) = resolver.pipe(self, &path).await {
                self.add_pipe(pipe, false);
                added += 1;
            }
        }
        added
    }

    /// Use `router` to reach this link.
    pub async fn router(&self, router: &Link) -> usize {
        self.add_path(Path::peer(&router.hashname)).await
    }

    /// Register a pipe, or refresh one already registered for the same path.
    ///
    /// A new pipe gets the current handshake unless `seen`. A `seen` pipe
    /// that had not answered since the last resync is stamped and the pipes
    /// re-ranked. Re-adding a stale pipe without `seen` resends the handshake
    /// to it. Returns `true` when the pipe was newly stamped as seen.
    pub fn add_pipe(&self, pipe: Arc<dyn Pipe>, seen: bool) -> bool {
        let mut resend = None;
        let mut promoted = false;
        {
            let mut inner = self.inner.lock();
            let existing = inner
                .pipes
                .iter()
                .find(|known| same_path(known.as_ref(), pipe.as_ref()))
                .cloned();
            let is_new = existing.is_none();
            let pipe = match existing {
                Some(known) => known,
                None => {
                    let observer: Weak<dyn LivenessObserver> = self.me.clone();
                    let subscription = pipe.events().subscribe(observer);
                    inner.subscriptions.insert(pipe.id(), subscription);
                    Self::note_path(&mut inner, pipe.path());
                    inner.pipes.push(pipe.clone());
                    tracing::debug!(hashname = %self.hashname.short(), pipe = %pipe.id(), path = %pipe.path(), "adding new pipe");
                    pipe
                }
            };

            let last = inner.seen.get(&pipe.id()).copied();
            let synced_at = inner.synced_at;
            if seen {
                inner.down.remove(&pipe.id());
                if last.is_none_or(|at| at < synced_at) {
                    let now = Instant::now();
                    inner.seen.insert(pipe.id(), now);
                    inner.rank();
                    promoted = true;
                    tracing::debug!(
                        hashname = %self.hashname.short(),
                        pipe = %pipe.id(),
                        latency_ms = now.saturating_duration_since(synced_at).as_millis() as u64,
                        "pipe seen"
                    );
                }
            } else if is_new {
                resend = Some((pipe, true));
            } else if last.is_some_and(|at| at < synced_at) {
                resend = Some((pipe, false));
            }
        }

        if seen {
            self.set_status(LinkStatus::Up);
        }
        if let Some((pipe, always)) = resend {
            self.send_handshake(pipe, always);
        }
        promoted
    }

    /// Drop a pipe and its event subscription. An empty link goes down.
    pub fn remove_pipe(&self, pipe: PipeId) -> bool {
        let empty = {
            let mut inner = self.inner.lock();
            let Some(index) = inner.pipes.iter().position(|known| known.id() == pipe) else {
                return false;
            };
            let removed = inner.pipes.remove(index);
            if let Some(subscription) = inner.subscriptions.remove(&pipe) {
                removed.events().unsubscribe(subscription);
            }
            inner.seen.remove(&pipe);
            inner.down.remove(&pipe);
            tracing::debug!(hashname = %self.hashname.short(), %pipe, path = %removed.path(), "removing pipe");
            inner.pipes.is_empty()
        };
        if empty {
            self.set_status(LinkStatus::Down("no pipes".into()));
        }
        true
    }

    /// A pipe reported itself down. The link stays up while any other pipe
    /// has answered since the last resync.
    pub fn pipe_down(&self, pipe: PipeId) {
        let alive = {
            let mut inner = self.inner.lock();
            if !inner.pipes.iter().any(|known| known.id() == pipe) {
                return;
            }
            inner.down.insert(pipe);
            inner
                .pipes
                .iter()
                .any(|known| !inner.down.contains(&known.id()) && inner.is_fresh(known.id()))
        };
        tracing::debug!(hashname = %self.hashname.short(), %pipe, alive, "pipe down");
        if alive {
            self.set_status(LinkStatus::Up);
        } else {
            self.set_status(LinkStatus::Down("all pipes are down".into()));
        }
    }

    /// Remove every pipe.
    pub fn close(&self) {
        let ids: Vec<PipeId> = self.inner.lock().pipes.iter().map(|pipe| pipe.id()).collect();
        for id in ids {
            self.remove_pipe(id);
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Transition to `status`, notifying observers. No-op if unchanged.
    pub fn set_status(&self, status: LinkStatus) {
        let (observers, channels) = {
            let mut inner = self.inner.lock();
            if inner.status == status {
                return;
            }
            inner.status = status.clone();
            let channels: Vec<Arc<Channel>> = if status.is_down() {
                inner.retired.clear();
                inner.channels.drain().map(|(_, channel)| channel).collect()
            } else {
                Vec::new()
            };
            (inner.observers.clone(), channels)
        };

        match &status {
            LinkStatus::Up => tracing::info!(hashname = %self.hashname, "link up"),
            LinkStatus::Down(reason) => tracing::info!(hashname = %self.hashname, %reason, "link down"),
            LinkStatus::Init => {}
        }
        for channel in &channels {
            channel.mark_gone();
        }
        for observer in &observers {
            observer.on_status(self, &status);
        }
        let _ = self.events.send(LinkEvent::Status(status.clone()));

        let mesh = self.mesh.upgrade();
        match status {
            LinkStatus::Up => {
                if let Some(mesh) = mesh {
                    mesh.emit(MeshEvent::Link(self.hashname));
                }
            }
            LinkStatus::Down(reason) => {
                let _ = self.events.send(LinkEvent::Down(reason));
                if let Some(mesh) = mesh {
                    mesh.emit(MeshEvent::Down(self.hashname));
                }
            }
            LinkStatus::Init => {}
        }
    }

    /// Register a status observer and return the current status.
    ///
    /// Registering the same observer twice is a no-op. If the link has left
    /// `init`, the observer is told the current status once, asynchronously.
    pub fn on_status(&self, observer: Arc<dyn StatusObserver>) -> LinkStatus {
        let current = {
            let mut inner = self.inner.lock();
            if inner.observers.iter().any(|known| Arc::ptr_eq(known, &observer)) {
                return inner.status.clone();
            }
            inner.observers.push(observer.clone());
            inner.status.clone()
        };
        if current != LinkStatus::Init
            && let Some(link) = self.me.upgrade()
        {
            spawn_detached(async move {
                let status = link.status();
                observer.on_status(&link, &status);
            });
        }
        current
    }

    // -----------------------------------------------------------------------
    // Traffic
    // -----------------------------------------------------------------------

    /// Encrypt `inner` and send it on the best pipe.
    pub async fn send(&self, inner: &Packet) -> Result<(), MeshError> {
        let exchange = self.exchange().ok_or(MeshError::NoExchange(self.hashname))?;
        let outer = exchange.encrypt(inner).await?;
        let pipe = self.best_pipe().ok_or(MeshError::NoPipes(self.hashname))?;
        tracing::trace!(hashname = %self.hashname.short(), pipe = %pipe.id(), "delivering packet");
        pipe.send(&outer).await?;
        Ok(())
    }

    /// Open a channel of type `kind`, sending `{type, c, …json}` with `body`.
    pub async fn open_channel(
        &self,
        kind: &str,
        mut json: Map<String, Value>,
        body: Vec<u8>,
    ) -> Result<Arc<Channel>, MeshError> {
        let exchange = self.exchange().ok_or(MeshError::NoExchange(self.hashname))?;
        let id = exchange.next_channel_id();
        let channel = Arc::new(Channel::new(id, kind, self.me.clone()));
        self.inner.lock().channels.insert(id, channel.clone());

        json.insert("type".into(), Value::from(kind));
        json.insert("c".into(), Value::from(id));
        if let Err(err) = self.send(&Packet::with_json(json, body)).await {
            channel.mark_gone();
            self.inner.lock().channels.remove(&id);
            return Err(err);
        }
        tracing::debug!(hashname = %self.hashname.short(), channel = id, kind, "channel opened");
        Ok(channel)
    }

    /// Register the channel an inbound open asks for, with the open packet queued.
    pub fn accept_channel(&self, request: &OpenRequest) -> Option<Arc<Channel>> {
        let id = request.channel_id()?;
        let kind = request.kind()?;
        let channel = Arc::new(Channel::new(id, kind, self.me.clone()));
        channel.receive(request.packet.clone());
        let mut inner = self.inner.lock();
        inner.retired.retain(|retired| *retired != id);
        inner.channels.insert(id, channel.clone());
        Some(channel)
    }
}

impl LivenessObserver for Link {
    fn on_pipe_event(&self, pipe: PipeId, event: &PipeEvent) {
        match event {
            PipeEvent::Keepalive => {
                self.sync();
            }
            PipeEvent::Down => self.pipe_down(pipe),
            PipeEvent::Closed => {
                self.remove_pipe(pipe);
            }
            PipeEvent::Error(err) => {
                tracing::debug!(hashname = %self.hashname.short(), %pipe, %err, "pipe error");
                self.remove_pipe(pipe);
            }
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Link")
            .field("hashname", &self.hashname)
            .field("status", &inner.status)
            .field("pipes", &inner.pipes.len())
            .field("exchange", &self.exchange.get().is_some())
            .finish()
    }
}
