//! URI routing.
//!
//! Builds a radix trie from the current route snapshot and dispatches
//! each request to at most one route handler. The trie is rebuilt
//! whenever the observed configuration version changes and published
//! atomically, so readers see either the old trie or the new one,
//! never a partially-built one.

mod matcher;
mod trie;

pub use matcher::{CompiledRoute, FilterFn, FilterRegistry};
pub use trie::Trie;

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::ctx::RequestContext;
use crate::store::RouteStore;

struct Built {
    trie: Trie<Arc<CompiledRoute>>,
    user_version: u64,
    api_version: u64,
}

/// Trie router over the route store.
pub struct Router {
    store: Arc<RouteStore>,
    filters: Arc<FilterRegistry>,
    built: ArcSwap<Built>,
    rebuild_lock: Mutex<()>,
}

impl Router {
    pub fn new(store: Arc<RouteStore>, filters: Arc<FilterRegistry>) -> Self {
        let built = Self::build(&store, &filters);
        Self {
            store,
            filters,
            built: ArcSwap::from_pointee(built),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Dispatches the request to the first matching route's handler.
    ///
    /// Rebuilds the trie first if the configuration moved. Returns true
    /// iff a handler ran; at most one handler runs per dispatch.
    pub fn match_request(&self, ctx: &mut RequestContext) -> bool {
        self.ensure_current();

        let built = self.built.load_full();
        for candidate in built.trie.collect(&ctx.path) {
            if candidate.matches(ctx) {
                (candidate.source.handler)(ctx);
                return true;
            }
        }
        false
    }

    /// The (user, api) versions the current trie was built from.
    pub fn built_versions(&self) -> (u64, u64) {
        let built = self.built.load();
        (built.user_version, built.api_version)
    }

    fn ensure_current(&self) {
        let current = self.built.load();
        if current.user_version == self.store.version()
            && current.api_version == self.store.api_version()
        {
            return;
        }
        drop(current);

        // Single-flight: one rebuild at a time, readers keep the old trie.
        let _guard = self
            .rebuild_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.built.load();
        if current.user_version == self.store.version()
            && current.api_version == self.store.api_version()
        {
            return;
        }
        drop(current);

        let built = Self::build(&self.store, &self.filters);
        self.built.store(Arc::new(built));
    }

    fn build(store: &RouteStore, filters: &FilterRegistry) -> Built {
        // Versions are read before the snapshots: a concurrent update
        // landing in between leaves a stale recorded version, which the
        // next match notices and rebuilds again.
        let user_version = store.version();
        let api_version = store.api_version();
        let (api, user) = store.snapshot();

        let mut trie = Trie::new();
        let mut installed = 0usize;

        // API-defined routes go in first.
        for route in api.iter().chain(user.iter()) {
            match CompiledRoute::compile(route.clone(), filters) {
                Ok(compiled) => {
                    let compiled = Arc::new(compiled);
                    for path in &route.route.paths {
                        trie.insert(path, route.route.priority, compiled.clone());
                    }
                    installed += 1;
                }
                Err(err) => {
                    tracing::warn!(route = %route.route.id, error = %err, "skipping route");
                }
            }
        }
        trie.finalize();

        tracing::debug!(
            version = user_version,
            api_version,
            routes = installed,
            "router rebuilt"
        );

        Built {
            trie,
            user_version,
            api_version,
        }
    }
}
