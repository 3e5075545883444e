//! Per-request context.
//!
//! Carries the request attributes the matcher and pickers read, the
//! variable accessor with per-request memoization, and the mutable
//! fields the balancer writes across retry attempts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use http::Method;

use crate::balancer::Picker;
use crate::config::UpstreamConf;
use crate::health::HealthChecker;

/// Variable names that may be assigned through the accessor.
///
/// Writes fan out to both the memo table and the transport variable
/// table; all other names are read-only.
const WRITABLE_VARS: &[&str] = &[
    "upstream_scheme",
    "upstream_host",
    "upstream_upgrade",
    "upstream_connection",
    "upstream_uri",
    "upstream_mirror_host",
    "upstream_cache_zone",
    "upstream_cache_zone_info",
    "upstream_no_cache",
    "upstream_cache_key",
    "upstream_cache_bypass",
    "upstream_hdr_expires",
    "upstream_hdr_cache_control",
];

/// Reference to the upstream cluster picked for this request.
///
/// Installed by the caller before `run` (the dispatcher falls back to
/// the matched route's embedded upstream).
#[derive(Clone)]
pub struct UpstreamRef {
    pub conf: Arc<UpstreamConf>,
    /// Cache key identifying the cluster.
    pub key: String,
    /// Configuration version of the cluster.
    pub version: u64,
    /// Key of the object whose cleanup list owns the checker.
    pub healthcheck_parent_key: Option<String>,
}

/// Fields the balancer writes while driving attempts for one request.
#[derive(Clone, Default)]
pub struct BalancerState {
    /// Number of `run` invocations so far; attempts 2..n are retries.
    pub try_count: u32,
    /// Endpoint host used on the most recent attempt.
    pub ip: Option<String>,
    /// Endpoint port used on the most recent attempt.
    pub port: Option<u16>,
    /// Picker serving this request, for post-request hooks.
    pub picker: Option<Arc<dyn Picker>>,
    /// Checker of the cluster, if the cluster defines checks.
    pub checker: Option<Arc<HealthChecker>>,
}

/// Per-request key/value bag.
pub struct RequestContext {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub remote_addr: IpAddr,
    /// Headers with normalized names (lowercase, `-` replaced by `_`).
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    /// Transport variable table (connection and request attributes).
    vars: HashMap<String, String>,
    /// Per-request memo for resolved variables.
    memo: HashMap<String, Option<String>>,
    /// Id of the route whose handler ran, set during dispatch.
    pub matched_route: Option<String>,
    pub upstream: Option<UpstreamRef>,
    pub balancer: BalancerState,
    /// Whether an endpoint was handed to the transport.
    pub proxy_passed: bool,
}

impl RequestContext {
    pub fn new(method: Method, host: &str, path: &str, remote_addr: IpAddr) -> Self {
        let mut vars = HashMap::new();
        vars.insert("uri".to_string(), path.to_string());
        vars.insert("host".to_string(), host.to_string());
        vars.insert("remote_addr".to_string(), remote_addr.to_string());
        vars.insert("request_method".to_string(), method.as_str().to_string());

        Self {
            method,
            host: host.to_string(),
            path: path.to_string(),
            remote_addr,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            vars,
            memo: HashMap::new(),
            matched_route: None,
            upstream: None,
            balancer: BalancerState::default(),
            proxy_passed: false,
        }
    }

    /// Adds a request header; the name is normalized for `http_*` lookup.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(normalize_header_name(name), value.to_string());
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    /// Adds a query argument, exposed as `arg_<name>`.
    pub fn with_arg(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(format!("arg_{name}"), value.to_string());
        self
    }

    /// Seeds an entry in the transport variable table.
    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    /// Installs the upstream reference consumed by `run`.
    pub fn set_upstream(&mut self, conf: Arc<UpstreamConf>, key: String, version: u64) {
        let healthcheck_parent_key = conf.parent_key.clone();
        self.upstream = Some(UpstreamRef {
            conf,
            key,
            version,
            healthcheck_parent_key,
        });
    }

    /// Resolves a variable, memoizing the result for the request's life.
    ///
    /// Resolution order: `method`, `cookie` (raw header), `cookie_*`,
    /// `http_*`, then the transport variable table.
    pub fn var(&mut self, name: &str) -> Option<String> {
        if let Some(hit) = self.memo.get(name) {
            return hit.clone();
        }
        let resolved = self.resolve(name);
        self.memo.insert(name.to_string(), resolved.clone());
        resolved
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if name == "method" {
            return Some(self.method.as_str().to_string());
        }
        if name == "cookie" {
            return self.headers.get("cookie").cloned();
        }
        if let Some(cookie) = name.strip_prefix("cookie_") {
            return self.cookies.get(cookie).cloned();
        }
        if let Some(header) = name.strip_prefix("http_") {
            return self.headers.get(header).cloned();
        }
        self.vars.get(name).cloned()
    }

    /// Assigns a writable variable.
    ///
    /// Returns false (and stores nothing) for names outside the writable
    /// set. Writes land in both the memo and the variable table.
    pub fn set_var(&mut self, name: &str, value: &str) -> bool {
        if !WRITABLE_VARS.contains(&name) {
            return false;
        }
        self.vars.insert(name.to_string(), value.to_string());
        self.memo
            .insert(name.to_string(), Some(value.to_string()));
        true
    }
}

/// Normalizes a header name for `http_*` lookup: lowercase, `-` to `_`.
fn normalize_header_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}
