//! Inbound handshakes: relay, validate, resolve the link, resync.

use std::collections::BTreeMap;
use std::sync::Arc;

use telehash_core::constants::HANDSHAKE_TYPE_LINK;
use telehash_core::hashname::parse_intermediates;
use telehash_core::{Csid, Hashname, Head, Keys, Packet, Token};
use telehash_transport::Pipe;

use crate::link::{Link, LinkStatus};
use crate::mesh::{LinkArgs, Mesh};
use crate::receive::outcome::{DropReason, HandshakeOutcome, ReceiveOutcome, plan_sync};

impl Mesh {
    pub(super) async fn receive_handshake(
        &self,
        csid: Csid,
        packet: Packet,
        lob: &[u8],
        pipe: Arc<dyn Pipe>,
    ) -> ReceiveOutcome {
        let Some(route) = Token::handshake_route(&packet.body) else {
            tracing::debug!(pipe = %pipe.id(), "handshake body too short");
            return ReceiveOutcome::Dropped(DropReason::Malformed);
        };
        if self.relay().has_route(&route) {
            return self.relay_packet(&route, lob).await;
        }

        // No reply on failure, so handshakes cannot be used as a probe.
        let inner = match self.identity().decrypt(&packet).await {
            Ok(inner) => inner,
            Err(err) => {
                tracing::debug!(pipe = %pipe.id(), %csid, %err, "handshake decrypt failed");
                return ReceiveOutcome::Dropped(DropReason::DecryptFailed);
            }
        };

        let link = match self.collect(csid, &inner).await {
            Ok(link) => link,
            Err(reason) => return ReceiveOutcome::Dropped(reason),
        };
        let Some(exchange) = link.exchange() else {
            tracing::debug!(hashname = %link.hashname().short(), "no exchange for handshake");
            return ReceiveOutcome::Dropped(DropReason::NoExchange);
        };

        let at_old = exchange.at();
        let in_sync = match exchange.sync(&packet, &inner).await {
            Ok(in_sync) => in_sync,
            Err(err) => {
                tracing::debug!(hashname = %link.hashname().short(), %err, "handshake sync failed");
                return ReceiveOutcome::Dropped(DropReason::DecryptFailed);
            }
        };
        let at_new = exchange.at();
        let plan = plan_sync(at_old, at_new, in_sync, self.settings().resync_jump_threshold);
        tracing::debug!(hashname = %link.hashname().short(), in_sync, at_old, at_new, "handshake sync");

        if plan.reply {
            link.send_handshake(pipe.clone(), false);
        }
        if plan.restart_round {
            tracing::debug!(hashname = %link.hashname().short(), "new outgoing sync");
            link.restart_sync_round();
        }
        let promoted = plan.trust_pipe && link.add_pipe(pipe, true);

        let new_session = link.observe_session(exchange.session_token());
        if new_session {
            tracing::info!(hashname = %link.hashname(), "new session");
            exchange.flush();
            link.set_status(LinkStatus::Up);
        }

        ReceiveOutcome::Handshake(HandshakeOutcome {
            hashname: link.hashname(),
            at_old,
            at_new,
            in_sync,
            replied: plan.reply,
            restarted: plan.restart_round,
            promoted,
            new_session,
        })
    }

    /// Identify the sender of a validated handshake and find or create its link.
    async fn collect(&self, csid: Csid, inner: &Packet) -> Result<Arc<Link>, DropReason> {
        if let Some(kind) = inner.json_str("type")
            && kind != HANDSHAKE_TYPE_LINK
        {
            tracing::debug!(kind, "ignoring handshake of unknown type");
            return Err(DropReason::Malformed);
        }

        let carried = Packet::decode(&inner.body).map_err(|err| {
            tracing::debug!(%err, "undecodable handshake key payload");
            DropReason::Malformed
        })?;
        let intermediates = match &carried.head {
            Head::Json(json) => parse_intermediates(json).map_err(|err| {
                tracing::debug!(%err, "bad handshake intermediates");
                DropReason::Malformed
            })?,
            _ => BTreeMap::new(),
        };
        let key = carried.body;
        let hashname = Hashname::from_intermediates(csid, &key, &intermediates).map_err(|err| {
            tracing::debug!(%err, "cannot derive handshake sender");
            DropReason::Malformed
        })?;
        if hashname == self.hashname() {
            tracing::debug!("dropping handshake from ourselves");
            return Err(DropReason::SelfHandshake);
        }

        let link = match self.get(&hashname) {
            Some(link) => link,
            None if self.settings().accept_unknown => self
                .link(LinkArgs::hashname(hashname))
                .await
                .map_err(|err| {
                    tracing::debug!(%hashname, %err, "cannot link handshake sender");
                    DropReason::Unaccepted
                })?,
            None => {
                tracing::debug!(%hashname, "refusing handshake from unknown hashname");
                return Err(DropReason::Unaccepted);
            }
        };

        if link.exchange().is_none() {
            let keys: Keys = [(csid, key)].into_iter().collect();
            link.set_info(&keys);
            link.create_exchange();
        }
        Ok(link)
    }
}
