//! Relay decisions for traffic addressed to tokens this node has no link for.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use telehash_core::{Fingerprint, Token};

use crate::dedup::DedupCache;
use crate::error::TransportError;
use crate::pipe::{Pipe, PipeId};
use crate::route::RouteTable;

/// What to do with a packet whose token matched no link.
#[derive(Clone)]
pub enum RelayDecision {
    /// Forward the packet, unchanged, on this pipe.
    Forward(Arc<dyn Pipe>),
    /// A route exists but this packet was already relayed in the current window.
    Duplicate,
    /// No route for the token.
    NoRoute,
}

impl core::fmt::Debug for RelayDecision {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Forward(pipe) => write!(f, "Forward({})", pipe.id()),
            Self::Duplicate => write!(f, "Duplicate"),
            Self::NoRoute => write!(f, "NoRoute"),
        }
    }
}

/// Route table plus the dedup cache that gates it.
pub struct Relay {
    routes: RouteTable,
    dedup: Mutex<DedupCache>,
}

impl Relay {
    pub fn new(window: Duration) -> Self {
        Self {
            routes: RouteTable::new(),
            dedup: Mutex::new(DedupCache::with_window(window)),
        }
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    #[must_use]
    pub fn has_route(&self, token: &Token) -> bool {
        self.routes.contains(token)
    }

    /// Decide whether to forward the encoded packet `lob` routed by `token`.
    ///
    /// The fingerprint is only recorded when a route exists.
    pub fn decide(&self, token: &Token, lob: &[u8]) -> RelayDecision {
        let Some(pipe) = self.routes.get(token) else {
            return RelayDecision::NoRoute;
        };
        if self.dedup.lock().is_duplicate(Fingerprint::of(lob)) {
            tracing::debug!(%token, "dropping duplicate relay packet");
            return RelayDecision::Duplicate;
        }
        RelayDecision::Forward(pipe)
    }

    /// Forward `lob` verbatim on `pipe`.
    pub async fn forward(pipe: &Arc<dyn Pipe>, lob: &[u8]) -> Result<PipeId, TransportError> {
        tracing::debug!(pipe = %pipe.id(), path = %pipe.path(), len = lob.len(), "relaying packet");
        pipe.send_raw(lob).await?;
        Ok(pipe.id())
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(crate::dedup::DEDUP_WINDOW)
    }
}
