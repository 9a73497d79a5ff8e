//! The mesh context: link registry, token index, relay routes and events.
//!
//! Every registry is owned by a [`Mesh`] value, so several independent
//! meshes can run in one process.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use telehash_core::{Hashname, Keys, Path, Token};
use telehash_transport::{LivenessObserver, Pipe, PipeEvent, PipeId, Relay, SubscriptionId};

use crate::config::{MeshConfig, MeshSection};
use crate::error::MeshError;
use crate::exchange::LocalIdentity;
use crate::extension::{Extensions, LinkHook, OpenHandler, PathResolver};
use crate::link::Link;

/// Process-wide notifications from one mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A link became reachable.
    Link(Hashname),
    /// A peer opened a channel on a link.
    Open {
        hashname: Hashname,
        channel: u32,
        kind: String,
    },
    /// A link went down.
    Down(Hashname),
}

/// Arguments to [`Mesh::link`].
#[derive(Debug, Clone, Default)]
pub struct LinkArgs {
    /// Derived from `keys` when absent.
    pub hashname: Option<Hashname>,
    pub keys: Keys,
    pub paths: Vec<Path>,
    pub pipe: Option<Arc<dyn Pipe>>,
    /// Mark (or unmark) the link as a default router.
    pub router: Option<bool>,
}

impl LinkArgs {
    pub fn hashname(hashname: Hashname) -> Self {
        Self {
            hashname: Some(hashname),
            ..Self::default()
        }
    }

    pub fn keys(keys: Keys) -> Self {
        Self {
            keys,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: Path) -> Self {
        self.paths.push(path);
        self
    }

    #[must_use]
    pub fn with_pipe(mut self, pipe: Arc<dyn Pipe>) -> Self {
        self.pipe = Some(pipe);
        self
    }
}

/// Builds a [`Mesh`] with its extensions fixed up front.
pub struct MeshBuilder {
    identity: Arc<dyn LocalIdentity>,
    settings: MeshSection,
    extensions: Extensions,
}

impl MeshBuilder {
    pub fn new(identity: Arc<dyn LocalIdentity>) -> Self {
        Self {
            identity,
            settings: MeshSection::default(),
            extensions: Extensions::new(),
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: MeshSection) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn path_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.extensions.add_resolver(resolver);
        self
    }

    #[must_use]
    pub fn open_handler(mut self, kind: impl Into<String>, handler: Arc<dyn OpenHandler>) -> Self {
        self.extensions.add_handler(kind, handler);
        self
    }

    #[must_use]
    pub fn link_hook(mut self, hook: Arc<dyn LinkHook>) -> Self {
        self.extensions.add_hook(hook);
        self
    }

    pub fn build(self) -> Arc<Mesh> {
        let (events, _) = broadcast::channel(self.settings.event_capacity.max(1));
        let relay = Relay::new(self.settings.dedup_window());
        tracing::debug!(hashname = %self.identity.hashname(), "mesh created");
        Arc::new_cyclic(|me| Mesh {
            identity: self.identity,
            settings: self.settings,
            extensions: self.extensions,
            links: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            routers: RwLock::new(Vec::new()),
            relay,
            route_watch: Mutex::new(HashMap::new()),
            events,
            me: me.clone(),
        })
    }
}

/// One local participant and everything it knows about its peers.
pub struct Mesh {
    identity: Arc<dyn LocalIdentity>,
    settings: MeshSection,
    extensions: Extensions,
    links: RwLock<HashMap<Hashname, Arc<Link>>>,
    index: RwLock<HashMap<Token, Arc<Link>>>,
    routers: RwLock<Vec<Hashname>>,
    relay: Relay,
    route_watch: Mutex<HashMap<PipeId, SubscriptionId>>,
    events: broadcast::Sender<MeshEvent>,
    me: Weak<Mesh>,
}

impl Mesh {
    pub fn builder(identity: Arc<dyn LocalIdentity>) -> MeshBuilder {
        MeshBuilder::new(identity)
    }

    /// Build a mesh from configuration and link every `[[links]]` entry.
    pub async fn from_config(
        identity: Arc<dyn LocalIdentity>,
        config: &MeshConfig,
        extensions: Extensions,
    ) -> Result<Arc<Self>, MeshError> {
        let mesh = MeshBuilder {
            identity,
            settings: config.mesh.clone(),
            extensions,
        }
        .build();
        for entry in &config.links {
            mesh.link(entry.to_args()?).await?;
        }
        Ok(mesh)
    }

    pub fn hashname(&self) -> Hashname {
        self.identity.hashname()
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<dyn LocalIdentity> {
        &self.identity
    }

    #[must_use]
    pub fn settings(&self) -> &MeshSection {
        &self.settings
    }

    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    #[must_use]
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        tracing::trace!(?event, "mesh event");
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Link registry
    // -----------------------------------------------------------------------

    /// Find or create the link for `args`, then apply keys, paths, an
    /// explicit pipe and default-router peer paths.
    pub async fn link(&self, args: LinkArgs) -> Result<Arc<Link>, MeshError> {
        let hashname = match args.hashname {
            Some(hashname) => hashname,
            None if !args.keys.is_empty() => Hashname::from_keys(&args.keys)?,
            None => return Err(MeshError::InvalidArgs("no hashname or keys".into())),
        };
        if hashname == self.hashname() {
            return Err(MeshError::SelfLink);
        }

        let link = self.find_or_create(hashname)?;

        if !args.keys.is_empty() {
            link.set_info(&args.keys);
            link.create_exchange();
        }
        for path in args.paths {
            link.add_path(path).await;
        }
        if let Some(pipe) = args.pipe {
            link.add_pipe(pipe, false);
        }

        let routers = self.routers.read().clone();
        for router in routers {
            if router != hashname {
                link.add_path(Path::peer(&router)).await;
            }
        }
        if let Some(router) = args.router {
            self.set_router(&link, router).await;
        }
        Ok(link)
    }

    fn find_or_create(&self, hashname: Hashname) -> Result<Arc<Link>, MeshError> {
        let mesh = self
            .me
            .upgrade()
            .ok_or_else(|| MeshError::InvalidArgs("mesh is shutting down".into()))?;
        let (link, created) = {
            let mut links = self.links.write();
            match links.get(&hashname) {
                Some(link) => (link.clone(), false),
                None => {
                    let link = Link::new(hashname, &mesh);
                    links.insert(hashname, link.clone());
                    (link, true)
                }
            }
        };
        if created {
            tracing::debug!(hashname = %hashname, "link created");
            for hook in self.extensions.hooks() {
                hook.on_link(&link);
            }
        }
        Ok(link)
    }

    #[must_use]
    pub fn get(&self, hashname: &Hashname) -> Option<Arc<Link>> {
        self.links.read().get(hashname).cloned()
    }

    #[must_use]
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.links.read().values().cloned().collect()
    }

    /// Close a link and drop it from the registry.
    pub fn remove(&self, hashname: &Hashname) -> Option<Arc<Link>> {
        let link = self.links.write().remove(hashname)?;
        self.index
            .write()
            .retain(|_, indexed| !Arc::ptr_eq(indexed, &link));
        self.routers.write().retain(|router| router != hashname);
        link.close();
        tracing::debug!(hashname = %hashname, "link removed");
        Some(link)
    }

    pub(crate) fn index_link(&self, token: Token, link: Arc<Link>) {
        self.index.write().insert(token, link);
    }

    /// Link whose exchange accepts channel packets carrying `token`.
    #[must_use]
    pub fn link_by_token(&self, token: &Token) -> Option<Arc<Link>> {
        self.index.read().get(token).cloned()
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Relay traffic for `token` to `pipe`.
    ///
    /// Routes through a pipe are dropped when it closes or fails.
    pub fn add_route(&self, token: Token, pipe: Arc<dyn Pipe>) {
        {
            let mut watched = self.route_watch.lock();
            if !watched.contains_key(&pipe.id()) {
                let observer: Weak<dyn LivenessObserver> = self.me.clone();
                watched.insert(pipe.id(), pipe.events().subscribe(observer));
            }
        }
        self.relay.routes().insert(token, pipe);
    }

    pub fn remove_route(&self, token: &Token) -> bool {
        let Some(pipe) = self.relay.routes().remove(token) else {
            return false;
        };
        if self.relay.routes().find_pipe(pipe.id()).is_none() {
            self.unwatch(pipe.as_ref());
        }
        true
    }

    fn unwatch(&self, pipe: &dyn Pipe) {
        if let Some(subscription) = self.route_watch.lock().remove(&pipe.id()) {
            pipe.events().unsubscribe(subscription);
        }
    }

    #[must_use]
    pub fn routers(&self) -> Vec<Hashname> {
        self.routers.read().clone()
    }

    /// Add or remove `link` as a default router.
    ///
    /// Existing links learn a peer path through a newly added router.
    pub async fn set_router(&self, link: &Arc<Link>, enabled: bool) {
        let hashname = link.hashname();
        let added = {
            let mut routers = self.routers.write();
            let known = routers.contains(&hashname);
            match (enabled, known) {
                (true, false) => {
                    routers.push(hashname);
                    true
                }
                (false, true) => {
                    routers.retain(|router| *router != hashname);
                    false
                }
                _ => false,
            }
        };
        if !added {
            return;
        }
        tracing::debug!(hashname = %hashname, "default router added");
        for other in self.links() {
            if other.hashname() != hashname {
                other.router(link).await;
            }
        }
    }
}

impl LivenessObserver for Mesh {
    fn on_pipe_event(&self, pipe: PipeId, event: &PipeEvent) {
        if !matches!(event, PipeEvent::Closed | PipeEvent::Error(_)) {
            return;
        }
        if let Some(route_pipe) = self.relay.routes().find_pipe(pipe) {
            self.unwatch(route_pipe.as_ref());
        }
        let removed = self.relay.routes().remove_pipe(pipe);
        tracing::debug!(%pipe, ?event, removed, "routes dropped with their pipe");
    }
}

impl core::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mesh")
            .field("hashname", &self.hashname())
            .field("links", &self.links.read().len())
            .field("routes", &self.relay.routes().len())
            .finish()
    }
}
