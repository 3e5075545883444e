//! Upstream selection and request dispatch.
//!
//! `Balancer::run` resolves a cluster to one concrete endpoint for the
//! current attempt: discovery, timeouts, retry accounting, healthy
//! subset, picker selection, and address resolution, in that order.
//! The balancer never retries by itself; the transport drives retries
//! by invoking `run` again on the same request.

mod chash;
mod ewma;
mod picker;
mod round_robin;

pub use chash::ChashPicker;
pub use ewma::EwmaPicker;
pub use picker::Picker;
pub use round_robin::RoundRobinPicker;

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::cache::{Cleanup, VersionedCache};
use crate::config::UpstreamNode;
use crate::ctx::RequestContext;
use crate::error::DispatchError;
use crate::health::HealthChecker;
use crate::router::{FilterRegistry, Router};
use crate::store::{InstalledRoute, RouteStore};
use crate::transport::{Discovery, FailureState, Transport};

const PICKER_CACHE_CAPACITY: usize = 256;
const CHECKER_CACHE_CAPACITY: usize = 256;
const ADDR_CACHE_CAPACITY: usize = 4096;
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Per-cluster picker and checker registries plus the address cache.
pub struct Balancer {
    pickers: VersionedCache<String, String, Arc<dyn Picker>>,
    checkers: VersionedCache<String, u64, Arc<HealthChecker>>,
    addrs: VersionedCache<String, (), (String, u16)>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl Balancer {
    pub fn new(discovery: Option<Arc<dyn Discovery>>) -> Self {
        Self {
            pickers: VersionedCache::new(PICKER_CACHE_CAPACITY, CACHE_TTL),
            checkers: VersionedCache::new(CHECKER_CACHE_CAPACITY, CACHE_TTL),
            addrs: VersionedCache::new(ADDR_CACHE_CAPACITY, CACHE_TTL),
            discovery,
        }
    }

    /// Resolves one endpoint for the current attempt and hands it to
    /// the transport.
    pub fn run(
        &self,
        ctx: &mut RequestContext,
        transport: &mut dyn Transport,
    ) -> Result<(), DispatchError> {
        let up = ctx
            .upstream
            .clone()
            .ok_or(DispatchError::NoValidNode)?;
        let conf = up.conf.clone();

        // 1. Resolve endpoints, through discovery when the cluster
        //    names a service.
        let nodes: Vec<UpstreamNode> = match &conf.service_name {
            Some(service) => {
                let discovery = self
                    .discovery
                    .as_ref()
                    .ok_or(DispatchError::DiscoveryUninitialized)?;
                discovery
                    .nodes(service)
                    .ok_or(DispatchError::DiscoveryUninitialized)?
            }
            None => conf.nodes.clone(),
        };
        if nodes.is_empty() {
            return Err(DispatchError::NoValidNode);
        }

        // 2. Per-cluster socket timeouts.
        if let Some(timeout) = &conf.timeout {
            transport.set_timeouts(timeout.connect, timeout.send, timeout.read);
        }

        // 3. Fast path: one endpoint needs no picker.
        if nodes.len() == 1 {
            let node = &nodes[0];
            ctx.balancer.ip = Some(node.host.clone());
            ctx.balancer.port = Some(node.port);
            transport
                .set_current_peer(&node.host, node.port)
                .map_err(DispatchError::SetPeer)?;
            ctx.proxy_passed = true;
            return Ok(());
        }

        // 4. Retry accounting: report the previous attempt before the
        //    next pick, at most once per completed attempt.
        ctx.balancer.try_count += 1;
        if ctx.balancer.try_count > 1 {
            if let Some(checker) = ctx.balancer.checker.clone() {
                report_previous_attempt(ctx, &checker, transport);
            }
        }

        // 5. Retry budget, first attempt only.
        if ctx.balancer.try_count == 1 {
            let retries = match conf.retries {
                Some(r) if r >= 0 => r,
                _ => nodes.len() as i32 - 1,
            };
            if retries > 0 {
                transport.set_more_tries(retries as u32);
            }
        }

        let checker = if conf.checks.is_some() {
            Some(self.fetch_checker(
                &up.key,
                up.healthcheck_parent_key.as_deref(),
                up.version,
                &conf,
                &nodes,
            )?)
        } else {
            None
        };
        ctx.balancer.checker = checker.clone();

        // 6. Picker, keyed by cluster and tagged with the versions that
        //    invalidate it.
        let version_tag = match &checker {
            Some(c) => format!("{}#{}", up.version, c.status_ver()),
            None => up.version.to_string(),
        };
        let conf_for_picker = conf.clone();
        let picker = self
            .pickers
            .get_or_create(up.key.clone(), version_tag, || {
                let eligible = match &checker {
                    Some(c) => c.healthy_subset(&nodes),
                    None => nodes.clone(),
                };
                let endpoints: Vec<(String, u32)> = eligible
                    .iter()
                    .map(|n| (n.endpoint(), n.weight))
                    .collect();
                let picker = picker::build_picker(&conf_for_picker, &endpoints)?;
                Ok((picker, None))
            })?;
        ctx.balancer.picker = Some(picker.clone());

        // 7. Pick an endpoint for this attempt.
        let endpoint = picker.pick(ctx)?;

        // 8. Endpoint string to (host, port).
        let (host, port) = self.resolve_addr(&endpoint)?;

        // 9. Publish the choice.
        ctx.balancer.ip = Some(host.clone());
        ctx.balancer.port = Some(port);
        transport
            .set_current_peer(&host, port)
            .map_err(DispatchError::SetPeer)?;
        ctx.proxy_passed = true;
        Ok(())
    }

    /// Post-request hook: forwards the attempt's latency and outcome to
    /// the picker that served it.
    pub fn after_balance(&self, ctx: &mut RequestContext, latency: Duration, failed: bool) {
        if let Some(picker) = ctx.balancer.picker.clone() {
            picker.after_balance(ctx, latency, failed);
        }
    }

    /// Parses `"host:port"` through the address cache; port defaults
    /// to 80.
    fn resolve_addr(&self, endpoint: &str) -> Result<(String, u16), DispatchError> {
        self.addrs
            .get_or_create(endpoint.to_string(), (), || {
                parse_endpoint(endpoint).map(|parsed| (parsed, None))
            })
    }

    fn fetch_checker(
        &self,
        upstream_key: &str,
        parent_key: Option<&str>,
        version: u64,
        conf: &crate::config::UpstreamConf,
        nodes: &[UpstreamNode],
    ) -> Result<Arc<HealthChecker>, DispatchError> {
        let key = format!("upstream#{}", parent_key.unwrap_or(upstream_key));
        let checks = conf.checks.clone().unwrap_or_default();

        self.checkers.get_or_create(key.clone(), version, || {
            let checker = HealthChecker::new(&key, checks, nodes);
            let for_cleanup = checker.clone();
            let cleanup: Cleanup = Box::new(move || for_cleanup.stop());
            Ok((checker, Some(cleanup)))
        })
    }

    /// Drops every cached checker and picker, stopping probe timers.
    pub fn shutdown(&self) {
        self.pickers.clear();
        self.checkers.clear();
        self.addrs.clear();
    }
}

/// Parses an endpoint string as `host:port` with the port optional.
fn parse_endpoint(addr: &str) -> Result<(String, u16), DispatchError> {
    let bad = || DispatchError::AddressParse(addr.to_string());

    if addr.is_empty() {
        return Err(bad());
    }

    // Bracketed IPv6: [::1] or [::1]:8080.
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad())?,
            None if tail.is_empty() => 80,
            None => return Err(bad()),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        // "host:port", as long as host itself has no colon.
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(bad());
            }
            Ok((host.to_string(), port.parse().map_err(|_| bad())?))
        }
        // Bare IPv6 without a port.
        Some(_) => Ok((addr.to_string(), 80)),
        None => Ok((addr.to_string(), 80)),
    }
}

/// Translates the transport's view of the previous attempt into exactly
/// one passive health report for the endpoint that served it.
fn report_previous_attempt(
    ctx: &RequestContext,
    checker: &HealthChecker,
    transport: &dyn Transport,
) {
    let (Some(ip), Some(port)) = (ctx.balancer.ip.as_deref(), ctx.balancer.port) else {
        return;
    };
    let hostname = checker.probe_hostname().map(String::from);
    let hostname = hostname.as_deref();

    match transport.get_last_failure() {
        Some((FailureState::Failed, 504)) => checker.report_timeout(ip, port, hostname),
        Some((FailureState::Failed, _)) => checker.report_tcp_failure(ip, port, hostname),
        Some((FailureState::Next, status)) => {
            checker.report_http_status(ip, port, hostname, status)
        }
        None => {}
    }
}

/// Public entry points: `match_request` and `run`.
///
/// Failures inside `run` surface as a 502 through the transport; the
/// caller only learns whether dispatch proceeded.
pub struct Dispatcher {
    router: Router,
    balancer: Balancer,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RouteStore>,
        filters: Arc<FilterRegistry>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Self {
        Self {
            router: Router::new(store, filters),
            balancer: Balancer::new(discovery),
        }
    }

    /// Dispatches the request through the trie router.
    pub fn match_request(&self, ctx: &mut RequestContext) -> bool {
        self.router.match_request(ctx)
    }

    /// Runs one balancing attempt for the route.
    ///
    /// Installs the route's embedded upstream on the context unless the
    /// caller already resolved a reference. Returns true iff an
    /// endpoint was handed to the transport.
    pub fn run(
        &self,
        route: &InstalledRoute,
        ctx: &mut RequestContext,
        transport: &mut dyn Transport,
    ) -> bool {
        if ctx.upstream.is_none() {
            if let Some(upstream) = &route.upstream {
                ctx.set_upstream(
                    upstream.clone(),
                    format!("routes#{}", route.route.id),
                    route.conf_version,
                );
            }
        }

        match self.balancer.run(ctx, transport) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    route = %route.route.id,
                    error = %err,
                    config = err.is_config(),
                    "dispatch failed"
                );
                transport.respond(StatusCode::BAD_GATEWAY);
                false
            }
        }
    }

    /// Post-request hook, forwarded to the picker that served the
    /// request.
    pub fn after_balance(&self, ctx: &mut RequestContext, latency: Duration, failed: bool) {
        self.balancer.after_balance(ctx, latency, failed);
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }
}
