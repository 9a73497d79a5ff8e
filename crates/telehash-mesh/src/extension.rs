//! Extension capabilities registered on a mesh.
//!
//! Extensions are fixed when the mesh is built and consulted in
//! registration order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use telehash_core::{Packet, Path};
use telehash_transport::Pipe;

use crate::error::MeshError;
use crate::link::Link;

/// Turns a path descriptor into a concrete pipe, or declines.
#[async_trait]
pub trait PathResolver: Send + Sync {
    async fn pipe(&self, link: &Link, path: &Path) -> Option<Arc<dyn Pipe>>;
}

/// An inbound channel open, as handed to an [`OpenHandler`].
#[derive(Clone)]
pub struct OpenRequest {
    /// Decrypted open packet carrying `type` and `c`.
    pub packet: Packet,
    /// Pipe the open arrived on.
    pub pipe: Arc<dyn Pipe>,
}

impl OpenRequest {
    #[must_use]
    pub fn channel_id(&self) -> Option<u32> {
        self.packet.json_u32("c")
    }

    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.packet.json_str("type")
    }
}

/// Handles channel opens of one type.
#[async_trait]
pub trait OpenHandler: Send + Sync {
    async fn open(&self, link: Arc<Link>, request: OpenRequest, bouncer: Bouncer);
}

/// Called once for every link the mesh creates.
pub trait LinkHook: Send + Sync {
    fn on_link(&self, link: &Arc<Link>);
}

/// Rejects a channel open with `{"err": …, "c": …}` on the same channel id.
#[derive(Clone)]
pub struct Bouncer {
    link: Arc<Link>,
    channel: u32,
}

impl Bouncer {
    pub(crate) fn new(link: Arc<Link>, channel: u32) -> Self {
        Self { link, channel }
    }

    #[must_use]
    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub async fn bounce(&self, err: &str) -> Result<(), MeshError> {
        let mut json = Map::new();
        json.insert("err".into(), Value::from(err));
        json.insert("c".into(), Value::from(self.channel));
        tracing::debug!(
            hashname = %self.link.hashname().short(),
            channel = self.channel,
            err,
            "bouncing open"
        );
        self.link.send(&Packet::json_only(json)).await
    }
}

/// The extension set of a mesh.
#[derive(Default, Clone)]
pub struct Extensions {
    resolvers: Vec<Arc<dyn PathResolver>>,
    handlers: Vec<(String, Arc<dyn OpenHandler>)>,
    hooks: Vec<Arc<dyn LinkHook>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resolver(&mut self, resolver: Arc<dyn PathResolver>) {
        self.resolvers.push(resolver);
    }

    pub fn add_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn OpenHandler>) {
        self.handlers.push((kind.into(), handler));
    }

    pub fn add_hook(&mut self, hook: Arc<dyn LinkHook>) {
        self.hooks.push(hook);
    }

    #[must_use]
    pub fn resolvers(&self) -> &[Arc<dyn PathResolver>] {
        &self.resolvers
    }

    /// First handler registered for `kind`.
    #[must_use]
    pub fn handler(&self, kind: &str) -> Option<Arc<dyn OpenHandler>> {
        self.handlers
            .iter()
            .find(|(registered, _)| registered == kind)
            .map(|(_, handler)| handler.clone())
    }

    #[must_use]
    pub fn hooks(&self) -> &[Arc<dyn LinkHook>] {
        &self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named(usize, Arc<AtomicUsize>);

    #[async_trait]
    impl OpenHandler for Named {
        async fn open(&self, _link: Arc<Link>, _request: OpenRequest, _bouncer: Bouncer) {
            self.1.store(self.0, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_first_registered_handler_wins() {
        let hit = Arc::new(AtomicUsize::new(0));
        let mut extensions = Extensions::new();
        extensions.add_handler("thtp", Arc::new(Named(1, hit.clone())));
        extensions.add_handler("thtp", Arc::new(Named(2, hit.clone())));
        extensions.add_handler("sock", Arc::new(Named(3, hit.clone())));

        assert!(extensions.handler("thtp").is_some());
        assert!(extensions.handler("stream").is_none());
        assert_eq!(extensions.handlers.len(), 3);
        assert!(Arc::ptr_eq(
            &extensions.handler("thtp").unwrap(),
            &extensions.handlers[0].1
        ));
    }
}
