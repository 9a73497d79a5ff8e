//! Channels: multiplexed logical streams inside a link.

use core::fmt;
use std::sync::Weak;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use telehash_core::Packet;

use crate::error::MeshError;
use crate::link::Link;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, nothing received yet.
    Open,
    /// At least one packet received.
    Active,
    /// Ended, failed, or its link went down. Terminal.
    Gone,
}

/// One logical exchange inside a link, identified by `c`.
pub struct Channel {
    id: u32,
    kind: String,
    link: Weak<Link>,
    state: Mutex<ChannelState>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl Channel {
    pub(crate) fn new(id: u32, kind: impl Into<String>, link: Weak<Link>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id,
            kind: kind.into(),
            link,
            state: Mutex::new(ChannelState::Open),
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Type tag from the opening packet.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.state() == ChannelState::Gone
    }

    /// Queue an inbound packet. Returns `false` if the channel is gone.
    ///
    /// A packet carrying `end` or `err` is still delivered, then the channel is gone.
    pub fn receive(&self, inner: Packet) -> bool {
        let last = inner.has_key("end") || inner.has_key("err");
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Gone {
                return false;
            }
            *state = if last {
                ChannelState::Gone
            } else {
                ChannelState::Active
            };
        }
        let mut inbox = self.inbox_tx.lock();
        if let Some(tx) = inbox.as_ref() {
            // The receiving half lives as long as the channel.
            let _ = tx.send(inner);
        }
        if last {
            inbox.take();
        }
        true
    }

    /// Next inbound packet, `None` once the channel is gone and drained.
    pub async fn recv(&self) -> Option<Packet> {
        self.inbox_rx.lock().await.recv().await
    }

    /// Send a packet on this channel. `c` is filled in.
    pub async fn send(&self, mut json: Map<String, Value>, body: Vec<u8>) -> Result<(), MeshError> {
        if self.is_gone() {
            return Err(MeshError::ChannelGone(self.id));
        }
        let link = self.link.upgrade().ok_or(MeshError::ChannelGone(self.id))?;
        json.insert("c".into(), Value::from(self.id));
        link.send(&Packet::with_json(json, body)).await
    }

    /// End the channel cleanly with `{"end": true}`.
    pub async fn close(&self) -> Result<(), MeshError> {
        let mut json = Map::new();
        json.insert("end".into(), Value::Bool(true));
        let result = self.send(json, Vec::new()).await;
        self.finish();
        result
    }

    /// End the channel with an error.
    pub async fn fail(&self, err: &str) -> Result<(), MeshError> {
        let mut json = Map::new();
        json.insert("err".into(), Value::from(err));
        let result = self.send(json, Vec::new()).await;
        self.finish();
        result
    }

    fn finish(&self) {
        self.mark_gone();
        if let Some(link) = self.link.upgrade() {
            link.retire_channel(self.id);
        }
    }

    pub(crate) fn mark_gone(&self) {
        *self.state.lock() = ChannelState::Gone;
        self.inbox_tx.lock().take();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
