//! Inbound channel traffic: token lookup, decrypt, deliver or open.

use std::sync::Arc;

use telehash_core::{Packet, Token};
use telehash_transport::Pipe;

use crate::extension::{Bouncer, OpenRequest};
use crate::link::{Link, spawn_detached};
use crate::mesh::{Mesh, MeshEvent};
use crate::receive::outcome::{ChannelPlan, DropReason, ReceiveOutcome, plan_channel};

const UNKNOWN_TYPE: &str = "unknown type";

impl Mesh {
    pub(super) async fn receive_channel(
        &self,
        packet: Packet,
        lob: &[u8],
        pipe: Arc<dyn Pipe>,
    ) -> ReceiveOutcome {
        if packet.body.is_empty() {
            tracing::trace!(pipe = %pipe.id(), "empty packet");
            return ReceiveOutcome::Dropped(DropReason::Empty);
        }
        let Some(token) = Token::from_body(&packet.body) else {
            tracing::debug!(pipe = %pipe.id(), len = packet.body.len(), "channel packet too short");
            return ReceiveOutcome::Dropped(DropReason::Malformed);
        };

        // No reply for unknown tokens: a spoofed sender must not get reflected traffic.
        let Some(link) = self.link_by_token(&token) else {
            return self.relay_packet(&token, lob).await;
        };
        let Some(exchange) = link.exchange() else {
            return ReceiveOutcome::Dropped(DropReason::NoExchange);
        };

        let inner = match exchange.decrypt(&packet).await {
            Ok(inner) => inner,
            Err(err) => {
                tracing::debug!(hashname = %link.hashname().short(), %err, "channel decrypt failed");
                return ReceiveOutcome::Dropped(DropReason::DecryptFailed);
            }
        };

        if !link.has_seen(pipe.as_ref()) {
            tracing::debug!(hashname = %link.hashname().short(), pipe = %pipe.id(), path = %pipe.path(), "never seen pipe");
            link.add_pipe(pipe.clone(), true);
            let background = link.clone();
            spawn_detached(async move {
                background.sync();
            });
        }

        let Some(channel_id) = inner.json_u32("c") else {
            tracing::debug!(hashname = %link.hashname().short(), "channel packet without id");
            return ReceiveOutcome::Dropped(DropReason::Malformed);
        };
        let existing = link.channel(channel_id);
        let gone = match &existing {
            Some(channel) => Some(channel.is_gone()),
            None => link.is_retired(channel_id).then_some(true),
        };

        match plan_channel(gone, &inner) {
            ChannelPlan::Deliver => {
                if let Some(channel) = existing
                    && channel.receive(inner)
                {
                    if channel.is_gone() {
                        link.retire_channel(channel_id);
                    }
                    return ReceiveOutcome::Delivered {
                        hashname: link.hashname(),
                        channel: channel_id,
                    };
                }
                ReceiveOutcome::Dropped(DropReason::ChannelGone)
            }
            ChannelPlan::DropGone => {
                link.retire_channel(channel_id);
                tracing::debug!(hashname = %link.hashname().short(), channel = channel_id, "incoming channel is gone");
                ReceiveOutcome::Dropped(DropReason::ChannelGone)
            }
            ChannelPlan::Invalid => {
                tracing::debug!(hashname = %link.hashname().short(), channel = channel_id, "invalid channel open");
                ReceiveOutcome::Dropped(DropReason::InvalidOpen)
            }
            ChannelPlan::Open(kind) => self.open(link, inner, pipe, channel_id, kind).await,
        }
    }

    async fn open(
        &self,
        link: Arc<Link>,
        inner: Packet,
        pipe: Arc<dyn Pipe>,
        channel: u32,
        kind: String,
    ) -> ReceiveOutcome {
        let hashname = link.hashname();
        tracing::debug!(hashname = %hashname.short(), channel, %kind, "new channel open");
        self.emit(MeshEvent::Open {
            hashname,
            channel,
            kind: kind.clone(),
        });

        let bouncer = Bouncer::new(link.clone(), channel);
        match self.extensions().handler(&kind) {
            Some(handler) => {
                let request = OpenRequest {
                    packet: inner,
                    pipe,
                };
                handler.open(link, request, bouncer).await;
                ReceiveOutcome::Opened {
                    hashname,
                    channel,
                    kind,
                }
            }
            None => {
                if let Err(err) = bouncer.bounce(UNKNOWN_TYPE).await {
                    tracing::debug!(hashname = %hashname.short(), channel, %err, "bounce send failed");
                }
                ReceiveOutcome::Bounced {
                    hashname,
                    channel,
                    reason: UNKNOWN_TYPE.to_string(),
                }
            }
        }
    }
}
