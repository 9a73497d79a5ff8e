//! The pipe capability: one physical path to a peer.
//!
//! A pipe is owned by transport code and shared with the links that use it.
//! Links learn about liveness changes by subscribing a [`LivenessObserver`];
//! the pipe only keeps a [`Weak`] reference back, so a link and its pipes
//! never keep each other alive.

use core::fmt;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use telehash_core::cloak::cloak;
use telehash_core::{Packet, Path};

use crate::error::TransportError;

/// Process-unique identifier of a pipe instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u64);

impl PipeId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Liveness events emitted by a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    /// Periodic read-side idle heartbeat.
    Keepalive,
    /// The transport believes the path is gone, it may come back.
    Down,
    /// The pipe was closed and will not be used again.
    Closed,
    /// The transport failed.
    Error(String),
}

/// Receives liveness events from pipes it subscribed to.
pub trait LivenessObserver: Send + Sync {
    fn on_pipe_event(&self, pipe: PipeId, event: &PipeEvent);
}

/// Handle returned by [`PipeEvents::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer list embedded in every pipe implementation.
#[derive(Default)]
pub struct PipeEvents {
    observers: Mutex<Vec<(SubscriptionId, Weak<dyn LivenessObserver>)>>,
    next: AtomicU64,
}

impl PipeEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Weak<dyn LivenessObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Deliver `event` to every live observer, pruning dropped ones.
    ///
    /// Observers are called outside the lock so they may unsubscribe
    /// themselves. Returns the number of observers reached.
    pub fn emit(&self, pipe: PipeId, event: PipeEvent) -> usize {
        let live: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|(_, weak)| weak.strong_count() > 0);
            observers.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        tracing::trace!(%pipe, ?event, observers = live.len(), "pipe event");
        for observer in &live {
            observer.on_pipe_event(pipe, &event);
        }
        live.len()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for PipeEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEvents")
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Encode a LOB frame for the wire, cloaking it if the pipe requires it.
pub fn frame(lob: &[u8], cloaked: bool) -> Vec<u8> {
    if cloaked { cloak(lob, 1) } else { lob.to_vec() }
}

/// One physical path to a peer.
///
/// Implementations must complete every send, signalling failure through the
/// returned error rather than dropping the packet silently, and must fail
/// sends on a path that is not open instead of queueing them.
#[async_trait]
pub trait Pipe: Send + Sync {
    fn id(&self) -> PipeId;

    /// Opaque, structurally comparable descriptor of this path.
    fn path(&self) -> &Path;

    /// Whether frames on this pipe are cloaked.
    fn is_cloaked(&self) -> bool;

    fn set_cloaked(&self, cloaked: bool);

    /// Interval of the keepalive heartbeat, if the transport emits one.
    fn keepalive(&self) -> Option<Duration> {
        None
    }

    fn events(&self) -> &PipeEvents;

    /// Put one already-framed datagram on the wire.
    async fn transmit(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Send encoded LOB bytes unchanged apart from cloaking.
    async fn send_raw(&self, lob: &[u8]) -> Result<(), TransportError> {
        self.transmit(frame(lob, self.is_cloaked())).await
    }

    /// Encode and send a packet.
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let lob = packet.encode()?;
        self.send_raw(&lob).await
    }
}

impl fmt::Debug for dyn Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id())
            .field("path", self.path())
            .field("cloaked", &self.is_cloaked())
            .finish()
    }
}

/// Two pipes are the same path if they share an id or an equal descriptor.
#[must_use]
pub fn same_path(a: &dyn Pipe, b: &dyn Pipe) -> bool {
    a.id() == b.id() || a.path() == b.path()
}
