//! Inbound packet dispatch.
//!
//! Every frame a pipe delivers goes through [`Mesh::receive`]: it is
//! decloaked, decoded and classified by head shape, then handed to the
//! handshake or channel path. Each packet is processed to completion; the
//! only suspension points are the exchange's decrypt and sync.

mod channel;
mod handshake;
pub mod outcome;

use std::sync::Arc;

use telehash_core::cloak::decloak;
use telehash_core::{Packet, PacketKind, Token};
use telehash_transport::{Pipe, Relay, RelayDecision};

use crate::mesh::Mesh;

pub use outcome::{
    ChannelPlan, DropReason, HandshakeOutcome, ReceiveOutcome, SyncPlan, plan_channel, plan_sync,
};

impl Mesh {
    /// Process one inbound frame received on `pipe`.
    pub async fn receive(&self, frame: &[u8], pipe: Arc<dyn Pipe>) -> ReceiveOutcome {
        let (lob, cloaked) = decloak(frame);
        if cloaked && !pipe.is_cloaked() {
            tracing::debug!(pipe = %pipe.id(), "pipe is cloaked");
            pipe.set_cloaked(true);
        }

        let packet = match Packet::decode(&lob) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(pipe = %pipe.id(), %err, "dropping undecodable packet");
                return ReceiveOutcome::Dropped(DropReason::Malformed);
            }
        };

        match packet.kind() {
            PacketKind::Channel => self.receive_channel(packet, &lob, pipe).await,
            PacketKind::Handshake(csid) => self.receive_handshake(csid, packet, &lob, pipe).await,
            kind => {
                tracing::debug!(pipe = %pipe.id(), ?kind, "dropping unhandled packet");
                ReceiveOutcome::Dropped(DropReason::Unhandled)
            }
        }
    }

    /// Forward `lob` verbatim if `token` has a route and the packet is fresh.
    async fn relay_packet(&self, token: &Token, lob: &[u8]) -> ReceiveOutcome {
        match self.relay().decide(token, lob) {
            RelayDecision::Forward(pipe) => match Relay::forward(&pipe, lob).await {
                Ok(pipe) => ReceiveOutcome::Relayed { pipe },
                Err(err) => {
                    tracing::debug!(%token, %err, "relay send failed");
                    ReceiveOutcome::Dropped(DropReason::RelayFailed)
                }
            },
            RelayDecision::Duplicate => ReceiveOutcome::Dropped(DropReason::Duplicate),
            RelayDecision::NoRoute => {
                tracing::debug!(%token, "dropping packet for unknown token");
                ReceiveOutcome::Dropped(DropReason::UnknownToken)
            }
        }
    }
}
