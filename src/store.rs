//! Versioned route storage.
//!
//! Holds the current full-sync snapshot of user routes plus an
//! independent snapshot of API-defined routes contributed by the plugin
//! layer. Snapshots are published atomically; readers capture a
//! reference at entry and use it for the duration of the request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::{Route, UpstreamConf};
use crate::ctx::RequestContext;

/// Callback bound when a route is installed; receives the request
/// context after the route wins dispatch.
pub type RouteHandler = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;

/// A route definition paired with its handler and the snapshot version
/// it was installed under. The embedded upstream, if any, is shared out
/// once here instead of being cloned per request.
pub struct InstalledRoute {
    pub route: Route,
    pub handler: RouteHandler,
    pub conf_version: u64,
    pub upstream: Option<Arc<UpstreamConf>>,
}

impl InstalledRoute {
    /// Installs a route with the default handler, which records the
    /// matched route id on the context.
    pub fn new(route: Route, conf_version: u64) -> Self {
        let id = route.id.clone();
        let handler: RouteHandler = Arc::new(move |ctx: &mut RequestContext| {
            ctx.matched_route = Some(id.clone());
        });
        Self::with_handler(route, conf_version, handler)
    }

    pub fn with_handler(route: Route, conf_version: u64, handler: RouteHandler) -> Self {
        let upstream = route.upstream.clone().map(Arc::new);
        Self {
            route,
            handler,
            conf_version,
            upstream,
        }
    }
}

/// Atomically-replaced storage for user and API-defined routes.
pub struct RouteStore {
    routes: ArcSwap<Vec<Arc<InstalledRoute>>>,
    api_routes: ArcSwap<Vec<Arc<InstalledRoute>>>,
    version: AtomicU64,
    api_version: AtomicU64,
}

impl RouteStore {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
            api_routes: ArcSwap::from_pointee(Vec::new()),
            version: AtomicU64::new(0),
            api_version: AtomicU64::new(0),
        }
    }

    /// Replaces all user routes with a full sync.
    ///
    /// Routes absent from the new snapshot are gone after this returns.
    /// Returns the applied version.
    pub fn update_routes(&self, routes: Vec<Route>, version: u64) -> u64 {
        let installed: Vec<Arc<InstalledRoute>> = routes
            .into_iter()
            .map(|r| Arc::new(InstalledRoute::new(r, version)))
            .collect();
        let count = installed.len();

        self.routes.store(Arc::new(installed));
        self.version.store(version, Ordering::SeqCst);

        tracing::info!(version, routes = count, "routes updated");
        version
    }

    /// Replaces user routes with pre-installed ones (custom handlers).
    pub fn install_routes(&self, routes: Vec<InstalledRoute>, version: u64) -> u64 {
        let installed: Vec<Arc<InstalledRoute>> = routes.into_iter().map(Arc::new).collect();
        self.routes.store(Arc::new(installed));
        self.version.store(version, Ordering::SeqCst);
        version
    }

    /// Replaces the API-defined routes owned by the plugin layer.
    ///
    /// Bumps the API snapshot version so the next `match` rebuilds.
    pub fn set_api_routes(&self, routes: Vec<InstalledRoute>) {
        let installed: Vec<Arc<InstalledRoute>> = routes.into_iter().map(Arc::new).collect();
        let count = installed.len();

        self.api_routes.store(Arc::new(installed));
        let version = self.api_version.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::info!(version, routes = count, "api routes updated");
    }

    /// Returns the current (api, user) snapshots.
    ///
    /// API routes come first: they are inserted into the trie ahead of
    /// user routes on rebuild.
    pub fn snapshot(&self) -> (Arc<Vec<Arc<InstalledRoute>>>, Arc<Vec<Arc<InstalledRoute>>>) {
        (self.api_routes.load_full(), self.routes.load_full())
    }

    /// Current user-route configuration version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Current API-route snapshot version.
    pub fn api_version(&self) -> u64 {
        self.api_version.load(Ordering::SeqCst)
    }

    /// Returns the count of (user routes, API routes).
    pub fn route_count(&self) -> (usize, usize) {
        (self.routes.load().len(), self.api_routes.load().len())
    }
}

impl Default for RouteStore {
    fn default() -> Self {
        Self::new()
    }
}
