//! In-memory pipe and conformance assertions for [`Pipe`] implementations.
//!
//! # Usage
//!
//! ```rust,ignore
//! use telehash_transport::testing::{self, MemoryPipe};
//!
//! let pipe = MemoryPipe::new(Path::new("test"));
//! testing::assert_pipe_conformance(pipe.as_ref()).await;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use telehash_core::cloak::decloak;
use telehash_core::{Packet, Path};

use crate::error::TransportError;
use crate::pipe::{Pipe, PipeEvent, PipeEvents, PipeId};

/// A pipe that records every frame it transmits.
pub struct MemoryPipe {
    id: PipeId,
    path: Path,
    cloaked: AtomicBool,
    connected: AtomicBool,
    keepalive: Option<Duration>,
    events: PipeEvents,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryPipe {
    pub fn new(path: Path) -> Arc<Self> {
        Arc::new(Self::build(path, None))
    }

    /// Pipe that advertises a keepalive interval.
    pub fn with_keepalive(path: Path, interval: Duration) -> Arc<Self> {
        Arc::new(Self::build(path, Some(interval)))
    }

    fn build(path: Path, keepalive: Option<Duration>) -> Self {
        Self {
            id: PipeId::next(),
            path,
            cloaked: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            keepalive,
            events: PipeEvents::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Raw frames in send order, cloaking included.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Sent frames decloaked and decoded. Undecodable frames are skipped.
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| Packet::decode(&decloak(frame).0).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Wait until at least `count` frames were sent. Returns `false` on timeout.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let poll = async {
            while self.sent_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Make further sends fail with [`TransportError::NotConnected`].
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Emit a liveness event to subscribers.
    pub fn emit(&self, event: PipeEvent) -> usize {
        self.events.emit(self.id, event)
    }
}

#[async_trait]
impl Pipe for MemoryPipe {
    fn id(&self) -> PipeId {
        self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_cloaked(&self) -> bool {
        self.cloaked.load(Ordering::SeqCst)
    }

    fn set_cloaked(&self, cloaked: bool) {
        self.cloaked.store(cloaked, Ordering::SeqCst);
    }

    fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    fn events(&self) -> &PipeEvents {
        &self.events
    }

    async fn transmit(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        tracing::trace!(pipe = %self.id, len = frame.len(), "memory pipe transmit");
        self.sent.lock().push(frame);
        Ok(())
    }
}

/// Assert that the pipe describes its path with a non-empty type.
pub fn assert_has_path(pipe: &dyn Pipe) {
    assert!(!pipe.path().kind.is_empty(), "pipe path type must not be empty");
}

/// Assert that the empty packet goes through, cloaked only when the pipe says so.
pub async fn assert_send_empty_packet(pipe: &dyn Pipe) {
    let result = pipe.send(&Packet::empty()).await;
    assert!(result.is_ok(), "sending the empty packet should succeed: {:?}", result.err());
}

/// Assert that toggling cloaking is observable.
pub fn assert_cloak_toggle(pipe: &dyn Pipe) {
    let before = pipe.is_cloaked();
    pipe.set_cloaked(!before);
    assert_eq!(pipe.is_cloaked(), !before, "set_cloaked should take effect");
    pipe.set_cloaked(before);
}

/// Assert that a disconnected pipe reports send failure instead of dropping silently.
pub async fn assert_send_after_disconnect_fails(pipe: &dyn Pipe) {
    let result = pipe.send_raw(&[0, 0]).await;
    assert!(result.is_err(), "send on a disconnected pipe should fail");
}

/// Run the connected-pipe checks: [`assert_has_path`], [`assert_cloak_toggle`]
/// and [`assert_send_empty_packet`].
pub async fn assert_pipe_conformance(pipe: &dyn Pipe) {
    assert_has_path(pipe);
    assert_cloak_toggle(pipe);
    assert_send_empty_packet(pipe).await;
}
