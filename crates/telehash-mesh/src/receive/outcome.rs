//! Outcomes of inbound packet processing and the pure decisions behind them.
//!
//! Inbound failures are never errors to the caller: each packet ends in one
//! [`ReceiveOutcome`], so relays, deliveries, bounces and drops are all
//! observable without exceptions.

use telehash_core::{Hashname, Packet};
use telehash_transport::PipeId;

/// Why an inbound packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Bytes did not decode, or a required field is missing.
    Malformed,
    /// The bare `00 00` intent signal.
    Empty,
    /// Head shape this dispatcher does not handle.
    Unhandled,
    /// Token matches neither a link nor a route.
    UnknownToken,
    /// Relay loop suppressed by the dedup cache.
    Duplicate,
    /// Forwarding on the route's pipe failed.
    RelayFailed,
    /// Handshake validation or channel decryption failed.
    DecryptFailed,
    /// The link has no exchange to process the packet with.
    NoExchange,
    /// Addressed to a channel that is gone.
    ChannelGone,
    /// Not a valid channel open.
    InvalidOpen,
    /// Handshake from an unknown hashname while unknown peers are refused.
    Unaccepted,
    /// Handshake carrying our own identity.
    SelfHandshake,
}

/// What a handshake did to its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub hashname: Hashname,
    pub at_old: u32,
    pub at_new: u32,
    /// The exchange reported the session in sync.
    pub in_sync: bool,
    /// A handshake was sent back on the receiving pipe.
    pub replied: bool,
    /// The seen round was restarted by a large counter jump.
    pub restarted: bool,
    /// The receiving pipe was newly stamped as seen.
    pub promoted: bool,
    /// The session token changed and channels were flushed.
    pub new_session: bool,
}

/// Result of processing one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Forwarded verbatim on a relay route.
    Relayed { pipe: PipeId },
    /// Delivered to an existing channel.
    Delivered { hashname: Hashname, channel: u32 },
    /// A channel open was handed to a registered handler.
    Opened {
        hashname: Hashname,
        channel: u32,
        kind: String,
    },
    /// A channel open was rejected with a bounce on the same channel id.
    Bounced {
        hashname: Hashname,
        channel: u32,
        reason: String,
    },
    Handshake(HandshakeOutcome),
    Dropped(DropReason),
}

impl ReceiveOutcome {
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

// ---------------------------------------------------------------------------
// Handshake sync plan
// ---------------------------------------------------------------------------

/// Follow-up actions after the exchange applied an inbound handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    /// Send our handshake back on the receiving pipe.
    pub reply: bool,
    /// Restart the link's seen round.
    pub restart_round: bool,
    /// Promote the receiving pipe with `add_pipe(pipe, true)`.
    pub trust_pipe: bool,
}

/// Plan the follow-up to an exchange sync.
///
/// * `at_old` / `at_new`: freshness counter before and after the sync.
/// * `in_sync`: what the exchange's sync reported.
/// * `jump_threshold`: a jump above this is our own resync coming back.
#[must_use]
pub fn plan_sync(at_old: u32, at_new: u32, in_sync: bool, jump_threshold: u32) -> SyncPlan {
    SyncPlan {
        reply: !in_sync,
        restart_round: at_new > at_old && at_new - at_old > jump_threshold,
        trust_pipe: at_new >= at_old,
    }
}

// ---------------------------------------------------------------------------
// Channel plan
// ---------------------------------------------------------------------------

/// What to do with a decrypted channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPlan {
    /// Hand to the existing channel.
    Deliver,
    /// The channel exists but is gone.
    DropGone,
    /// A new open of this type.
    Open(String),
    /// Neither a known channel nor a valid open.
    Invalid,
}

/// Plan the handling of a decrypted channel packet.
///
/// * `existing`: `None` if no channel has this id, otherwise whether it is gone.
#[must_use]
pub fn plan_channel(existing: Option<bool>, inner: &Packet) -> ChannelPlan {
    let kind = inner.json_str("type");
    match (existing, kind) {
        (Some(true), None) => ChannelPlan::DropGone,
        (Some(false), None) => ChannelPlan::Deliver,
        _ if inner.has_key("err") => ChannelPlan::Invalid,
        (_, Some(kind)) => ChannelPlan::Open(kind.to_string()),
        (None, None) => ChannelPlan::Invalid,
    }
}
