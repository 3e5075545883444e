//! Route candidate filtering.
//!
//! A route is compiled once per trie rebuild: method set, host patterns,
//! CIDR ranges, predicate operands (regexes included), and the named
//! filter are all resolved up front so the per-request check is cheap.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::config::{Operand, VarOperator, VarPredicate};
use crate::ctx::RequestContext;
use crate::error::RouteCompileError;
use crate::store::InstalledRoute;

/// User predicate evaluated against the request context.
pub type FilterFn = dyn Fn(&mut RequestContext) -> bool + Send + Sync;

/// Registry of named filter predicates.
///
/// Routes reference filters by name; configuration never carries code.
/// A route naming an unregistered filter is skipped at rebuild.
pub struct FilterRegistry {
    filters: DashMap<String, Arc<FilterFn>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: DashMap::new(),
        }
    }

    pub fn register<F>(&self, name: &str, filter: F)
    where
        F: Fn(&mut RequestContext) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(filter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<FilterFn>> {
        self.filters.get(name).map(|entry| entry.value().clone())
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Host pattern: literal or leading `*.` wildcard.
///
/// Wildcards match exactly one label: `*.example.com` matches
/// `a.example.com` but neither `example.com` nor `a.b.example.com`.
enum HostPattern {
    Exact(String),
    /// Stored as the `.suffix` the host must end with.
    Wildcard(String),
}

impl HostPattern {
    fn parse(pattern: &str) -> Self {
        let lowered = pattern.to_lowercase();
        match lowered.strip_prefix("*.") {
            Some(suffix) => Self::Wildcard(format!(".{suffix}")),
            None => Self::Exact(lowered),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(pattern) => host == pattern,
            Self::Wildcard(suffix) => {
                if !host.ends_with(suffix.as_str()) {
                    return false;
                }
                let label = &host[..host.len() - suffix.len()];
                !label.is_empty() && !label.contains('.')
            }
        }
    }
}

/// A CIDR range, hand-parsed so matching is plain mask arithmetic.
enum Cidr {
    V4 { net: u32, prefix: u8 },
    V6 { net: u128, prefix: u8 },
}

impl Cidr {
    fn parse(range: &str) -> Result<Self, RouteCompileError> {
        let bad = || RouteCompileError::BadCidr(range.to_string());

        let (addr, prefix) = match range.split_once('/') {
            Some((addr, len)) => {
                let ip: IpAddr = addr.parse().map_err(|_| bad())?;
                let prefix: u8 = len.parse().map_err(|_| bad())?;
                (ip, Some(prefix))
            }
            None => (range.parse().map_err(|_| bad())?, None),
        };

        match addr {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(bad());
                }
                Ok(Self::V4 {
                    net: u32::from_be_bytes(v4.octets()),
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(bad());
                }
                Ok(Self::V6 {
                    net: u128::from_be_bytes(v6.octets()),
                    prefix,
                })
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { net, prefix }, IpAddr::V4(v4)) => {
                let mask = if *prefix == 0 {
                    0
                } else {
                    !((1u32 << (32 - prefix)) - 1)
                };
                (u32::from_be_bytes(v4.octets()) & mask) == (net & mask)
            }
            (Self::V6 { net, prefix }, IpAddr::V6(v6)) => {
                let mask = if *prefix == 0 {
                    0
                } else {
                    !((1u128 << (128 - prefix)) - 1)
                };
                (u128::from_be_bytes(v6.octets()) & mask) == (net & mask)
            }
            _ => false,
        }
    }
}

/// One compiled `vars` predicate.
struct CompiledPredicate {
    name: String,
    op: VarOperator,
    operand: Operand,
    regex: Option<Regex>,
}

impl CompiledPredicate {
    fn compile(pred: &VarPredicate) -> Result<Self, RouteCompileError> {
        let regex = if pred.op == VarOperator::Regex {
            let pattern = match &pred.operand {
                Operand::Value(v) => v.as_str(),
                Operand::List(_) => "",
            };
            Some(
                Regex::new(pattern).map_err(|source| RouteCompileError::BadRegex {
                    name: pred.name.clone(),
                    pattern: pattern.to_string(),
                    source,
                })?,
            )
        } else {
            None
        };

        Ok(Self {
            name: pred.name.clone(),
            op: pred.op,
            operand: pred.operand.clone(),
            regex,
        })
    }

    fn holds(&self, ctx: &mut RequestContext) -> bool {
        let value = ctx.var(&self.name);
        match self.op {
            VarOperator::Eq => value.as_deref() == self.scalar(),
            VarOperator::Ne => value.as_deref() != self.scalar(),
            VarOperator::Gt => self.ordered(value.as_deref(), |o| o == Ordering::Greater),
            VarOperator::Lt => self.ordered(value.as_deref(), |o| o == Ordering::Less),
            VarOperator::Ge => self.ordered(value.as_deref(), |o| o != Ordering::Less),
            VarOperator::Le => self.ordered(value.as_deref(), |o| o != Ordering::Greater),
            VarOperator::Regex => match (&self.regex, value) {
                (Some(re), Some(v)) => re.is_match(&v),
                _ => false,
            },
            VarOperator::In => match (&self.operand, value) {
                (Operand::List(list), Some(v)) => list.iter().any(|item| item == &v),
                (Operand::Value(single), Some(v)) => single == &v,
                _ => false,
            },
        }
    }

    fn scalar(&self) -> Option<&str> {
        match &self.operand {
            Operand::Value(v) => Some(v.as_str()),
            Operand::List(list) => list.first().map(String::as_str),
        }
    }

    /// True iff the resolved value compares to the operand as `accept`
    /// allows. Numeric comparison when both sides parse as f64,
    /// lexicographic otherwise; an unresolved variable never satisfies
    /// an ordering.
    fn ordered(&self, value: Option<&str>, accept: impl Fn(Ordering) -> bool) -> bool {
        let (Some(value), Some(operand)) = (value, self.scalar()) else {
            return false;
        };
        accept(compare_values(value, operand))
    }
}

fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// A route with every match attribute resolved for the hot path.
pub struct CompiledRoute {
    pub source: Arc<InstalledRoute>,
    methods: Option<HashSet<String>>,
    hosts: Option<Vec<HostPattern>>,
    cidrs: Option<Vec<Cidr>>,
    predicates: Vec<CompiledPredicate>,
    filter: Option<Arc<FilterFn>>,
}

impl CompiledRoute {
    pub fn compile(
        source: Arc<InstalledRoute>,
        filters: &FilterRegistry,
    ) -> Result<Self, RouteCompileError> {
        let route = &source.route;

        let methods = route
            .methods
            .as_ref()
            .map(|ms| ms.iter().map(|m| m.to_uppercase()).collect());

        let hosts = route
            .hosts
            .as_ref()
            .map(|hs| hs.iter().map(|h| HostPattern::parse(h)).collect());

        let cidrs = match &route.remote_addrs {
            Some(ranges) => Some(
                ranges
                    .iter()
                    .map(|r| Cidr::parse(r))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let predicates = match &route.vars {
            Some(preds) => preds
                .iter()
                .map(CompiledPredicate::compile)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let filter = match &route.filter {
            Some(name) => Some(
                filters
                    .get(name)
                    .ok_or_else(|| RouteCompileError::UnknownFilter(name.clone()))?,
            ),
            None => None,
        };

        Ok(Self {
            source,
            methods,
            hosts,
            cidrs,
            predicates,
            filter,
        })
    }

    /// Applies the sequential filter cascade from cheapest to dearest.
    pub fn matches(&self, ctx: &mut RequestContext) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(ctx.method.as_str()) {
                return false;
            }
        }

        if let Some(hosts) = &self.hosts {
            let host = normalize_hostname(&ctx.host);
            if !hosts.iter().any(|p| p.matches(&host)) {
                return false;
            }
        }

        if let Some(cidrs) = &self.cidrs {
            if !cidrs.iter().any(|c| c.contains(ctx.remote_addr)) {
                return false;
            }
        }

        for pred in &self.predicates {
            if !pred.holds(ctx) {
                return false;
            }
        }

        if let Some(filter) = &self.filter {
            if !filter(ctx) {
                return false;
            }
        }

        true
    }
}

/// Lowercases a hostname and strips any port suffix.
fn normalize_hostname(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Route;
    use http::Method;

    fn make_ctx(host: &str, path: &str) -> RequestContext {
        RequestContext::new(Method::GET, host, path, "10.0.0.1".parse().unwrap())
    }

    fn compile(route: Route) -> CompiledRoute {
        let filters = FilterRegistry::new();
        CompiledRoute::compile(Arc::new(InstalledRoute::new(route, 1)), &filters).unwrap()
    }

    // ========== Phase 1: Method & Host ==========

    #[test]
    fn test_method_filter() {
        let compiled = compile(Route {
            methods: Some(vec!["get".to_string(), "POST".to_string()]),
            ..Route::new("r", vec!["/p"])
        });
        assert!(compiled.matches(&mut make_ctx("h", "/p")));

        let mut put = RequestContext::new(Method::PUT, "h", "/p", "10.0.0.1".parse().unwrap());
        assert!(!compiled.matches(&mut put));
    }

    #[test]
    fn test_exact_host_case_insensitive_with_port() {
        let compiled = compile(Route {
            hosts: Some(vec!["Example.COM".to_string()]),
            ..Route::new("r", vec!["/p"])
        });
        assert!(compiled.matches(&mut make_ctx("example.com", "/p")));
        assert!(compiled.matches(&mut make_ctx("EXAMPLE.COM:8080", "/p")));
        assert!(!compiled.matches(&mut make_ctx("other.com", "/p")));
    }

    #[test]
    fn test_wildcard_host_single_label() {
        let compiled = compile(Route {
            hosts: Some(vec!["*.example.com".to_string()]),
            ..Route::new("r", vec!["/p"])
        });
        assert!(compiled.matches(&mut make_ctx("foo.example.com", "/p")));
        assert!(!compiled.matches(&mut make_ctx("example.com", "/p")));
        assert!(!compiled.matches(&mut make_ctx("a.b.example.com", "/p")));
    }

    // ========== Phase 2: CIDR ==========

    #[test]
    fn test_cidr_v4_range_and_exact() {
        let compiled = compile(Route {
            remote_addrs: Some(vec!["10.0.0.0/8".to_string()]),
            ..Route::new("r", vec!["/p"])
        });
        assert!(compiled.matches(&mut make_ctx("h", "/p"))); // 10.0.0.1

        let mut outside =
            RequestContext::new(Method::GET, "h", "/p", "192.168.1.1".parse().unwrap());
        assert!(!compiled.matches(&mut outside));

        let exact = compile(Route {
            remote_addrs: Some(vec!["10.0.0.1".to_string()]),
            ..Route::new("r", vec!["/p"])
        });
        assert!(exact.matches(&mut make_ctx("h", "/p")));
    }

    #[test]
    fn test_cidr_v6() {
        let compiled = compile(Route {
            remote_addrs: Some(vec!["fd00::/8".to_string()]),
            ..Route::new("r", vec!["/p"])
        });
        let mut inside = RequestContext::new(Method::GET, "h", "/p", "fd00::1".parse().unwrap());
        assert!(compiled.matches(&mut inside));
        let mut v4 = RequestContext::new(Method::GET, "h", "/p", "10.0.0.1".parse().unwrap());
        assert!(!compiled.matches(&mut v4));
    }

    #[test]
    fn test_bad_cidr_rejected_at_compile() {
        let filters = FilterRegistry::new();
        let route = Route {
            remote_addrs: Some(vec!["10.0.0.0/64".to_string()]),
            ..Route::new("r", vec!["/p"])
        };
        let result = CompiledRoute::compile(Arc::new(InstalledRoute::new(route, 1)), &filters);
        assert!(matches!(result, Err(RouteCompileError::BadCidr(_))));
    }

    // ========== Phase 3: Vars Predicates ==========

    fn pred(name: &str, op: VarOperator, operand: Operand) -> VarPredicate {
        VarPredicate {
            name: name.to_string(),
            op,
            operand,
        }
    }

    #[test]
    fn test_vars_eq_and_ne() {
        let compiled = compile(Route {
            vars: Some(vec![pred(
                "arg_x",
                VarOperator::Eq,
                Operand::Value("1".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        let mut yes = make_ctx("h", "/p").with_arg("x", "1");
        assert!(compiled.matches(&mut yes));
        let mut no = make_ctx("h", "/p").with_arg("x", "2");
        assert!(!compiled.matches(&mut no));
        let mut missing = make_ctx("h", "/p");
        assert!(!compiled.matches(&mut missing));

        let ne = compile(Route {
            vars: Some(vec![pred(
                "arg_x",
                VarOperator::Ne,
                Operand::Value("1".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        let mut other = make_ctx("h", "/p").with_arg("x", "2");
        assert!(ne.matches(&mut other));
        // A missing variable is not equal to the operand.
        let mut missing = make_ctx("h", "/p");
        assert!(ne.matches(&mut missing));
    }

    #[test]
    fn test_vars_numeric_ordering() {
        let compiled = compile(Route {
            vars: Some(vec![pred(
                "arg_n",
                VarOperator::Gt,
                Operand::Value("9".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        // "10" > "9" numerically even though it sorts lower as a string.
        let mut ten = make_ctx("h", "/p").with_arg("n", "10");
        assert!(compiled.matches(&mut ten));
        let mut nine = make_ctx("h", "/p").with_arg("n", "9");
        assert!(!compiled.matches(&mut nine));

        let ge = compile(Route {
            vars: Some(vec![pred(
                "arg_n",
                VarOperator::Ge,
                Operand::Value("9".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        let mut nine = make_ctx("h", "/p").with_arg("n", "9");
        assert!(ge.matches(&mut nine));
        let mut missing = make_ctx("h", "/p");
        assert!(!ge.matches(&mut missing));
    }

    #[test]
    fn test_vars_lexicographic_fallback() {
        let compiled = compile(Route {
            vars: Some(vec![pred(
                "arg_s",
                VarOperator::Lt,
                Operand::Value("beta".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        let mut alpha = make_ctx("h", "/p").with_arg("s", "alpha");
        assert!(compiled.matches(&mut alpha));
        let mut gamma = make_ctx("h", "/p").with_arg("s", "gamma");
        assert!(!compiled.matches(&mut gamma));
    }

    #[test]
    fn test_vars_regex_and_in() {
        let compiled = compile(Route {
            vars: Some(vec![pred(
                "http_user_agent",
                VarOperator::Regex,
                Operand::Value("^curl/".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        let mut curl = make_ctx("h", "/p").with_header("User-Agent", "curl/8.0");
        assert!(compiled.matches(&mut curl));
        let mut firefox = make_ctx("h", "/p").with_header("User-Agent", "Mozilla/5.0");
        assert!(!compiled.matches(&mut firefox));

        let within = compile(Route {
            vars: Some(vec![pred(
                "arg_env",
                VarOperator::In,
                Operand::List(vec!["dev".to_string(), "staging".to_string()]),
            )]),
            ..Route::new("r", vec!["/p"])
        });
        let mut dev = make_ctx("h", "/p").with_arg("env", "dev");
        assert!(within.matches(&mut dev));
        let mut prod = make_ctx("h", "/p").with_arg("env", "prod");
        assert!(!within.matches(&mut prod));
    }

    #[test]
    fn test_vars_conjunction() {
        let compiled = compile(Route {
            vars: Some(vec![
                pred("arg_x", VarOperator::Eq, Operand::Value("1".to_string())),
                pred("arg_y", VarOperator::Eq, Operand::Value("2".to_string())),
            ]),
            ..Route::new("r", vec!["/p"])
        });
        let mut both = make_ctx("h", "/p").with_arg("x", "1").with_arg("y", "2");
        assert!(compiled.matches(&mut both));
        let mut one = make_ctx("h", "/p").with_arg("x", "1");
        assert!(!compiled.matches(&mut one));
    }

    #[test]
    fn test_bad_regex_rejected_at_compile() {
        let filters = FilterRegistry::new();
        let route = Route {
            vars: Some(vec![pred(
                "arg_x",
                VarOperator::Regex,
                Operand::Value("(".to_string()),
            )]),
            ..Route::new("r", vec!["/p"])
        };
        let result = CompiledRoute::compile(Arc::new(InstalledRoute::new(route, 1)), &filters);
        assert!(matches!(result, Err(RouteCompileError::BadRegex { .. })));
    }

    // ========== Phase 4: Named Filters ==========

    #[test]
    fn test_filter_predicate() {
        let filters = FilterRegistry::new();
        filters.register("host-is-a", |ctx: &mut RequestContext| {
            ctx.var("host").as_deref() == Some("a.example")
        });

        let route = Route {
            filter: Some("host-is-a".to_string()),
            ..Route::new("r", vec!["/p"])
        };
        let compiled =
            CompiledRoute::compile(Arc::new(InstalledRoute::new(route, 1)), &filters).unwrap();

        assert!(compiled.matches(&mut make_ctx("a.example", "/p")));
        assert!(!compiled.matches(&mut make_ctx("b.example", "/p")));
    }

    #[test]
    fn test_unknown_filter_rejected_at_compile() {
        let filters = FilterRegistry::new();
        let route = Route {
            filter: Some("nope".to_string()),
            ..Route::new("r", vec!["/p"])
        };
        let result = CompiledRoute::compile(Arc::new(InstalledRoute::new(route, 1)), &filters);
        assert!(matches!(result, Err(RouteCompileError::UnknownFilter(_))));
    }

    #[test]
    fn test_no_constraints_always_matches() {
        let compiled = compile(Route::new("r", vec!["/p"]));
        assert!(compiled.matches(&mut make_ctx("anything", "/p")));
    }
}
