//! Relay route table: token → pipe to forward on.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use telehash_core::Token;

use crate::pipe::{Pipe, PipeId};

/// Shared route table. Lookups run concurrently; inserts and removals are exclusive.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<Token, Arc<dyn Pipe>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for `token`.
    pub fn insert(&self, token: Token, pipe: Arc<dyn Pipe>) -> Option<Arc<dyn Pipe>> {
        tracing::debug!(%token, pipe = %pipe.id(), path = %pipe.path(), "route added");
        self.routes.write().insert(token, pipe)
    }

    pub fn remove(&self, token: &Token) -> Option<Arc<dyn Pipe>> {
        self.routes.write().remove(token)
    }

    #[must_use]
    pub fn get(&self, token: &Token) -> Option<Arc<dyn Pipe>> {
        self.routes.read().get(token).cloned()
    }

    #[must_use]
    pub fn contains(&self, token: &Token) -> bool {
        self.routes.read().contains_key(token)
    }

    /// Any route's pipe with id `pipe`.
    #[must_use]
    pub fn find_pipe(&self, pipe: PipeId) -> Option<Arc<dyn Pipe>> {
        self.routes
            .read()
            .values()
            .find(|route| route.id() == pipe)
            .cloned()
    }

    /// Drop every route through `pipe`. Returns how many were removed.
    pub fn remove_pipe(&self, pipe: PipeId) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, route| route.id() != pipe);
        before - routes.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
