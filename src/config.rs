//! Route and upstream configuration types.
//!
//! These are the shapes pushed by the configuration subsystem on every
//! snapshot. The watch mechanism itself lives outside this crate; the
//! store exposes a programmatic full-sync surface instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the default load-balancing policy.
pub const DEFAULT_BALANCER: &str = "roundrobin";

fn default_balancer() -> String {
    DEFAULT_BALANCER.to_string()
}

/// A single backend endpoint inside a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamNode {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl UpstreamNode {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            metadata: HashMap::new(),
        }
    }

    /// The `"host:port"` form used as a picker endpoint and health key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-phase socket timeouts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConf {
    pub connect: f64,
    pub send: f64,
    pub read: f64,
}

/// Success thresholds and the statuses that count as success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthyThresholds {
    #[serde(default = "default_healthy_statuses")]
    pub http_statuses: Vec<u16>,
    #[serde(default = "default_successes")]
    pub successes: u32,
}

impl Default for HealthyThresholds {
    fn default() -> Self {
        Self {
            http_statuses: default_healthy_statuses(),
            successes: default_successes(),
        }
    }
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200, 302]
}

fn default_successes() -> u32 {
    2
}

/// Failure thresholds, counted separately per failure kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnhealthyThresholds {
    #[serde(default = "default_unhealthy_statuses")]
    pub http_statuses: Vec<u16>,
    #[serde(default = "default_http_failures")]
    pub http_failures: u32,
    #[serde(default = "default_tcp_failures")]
    pub tcp_failures: u32,
    #[serde(default = "default_timeouts")]
    pub timeouts: u32,
}

impl Default for UnhealthyThresholds {
    fn default() -> Self {
        Self {
            http_statuses: default_unhealthy_statuses(),
            http_failures: default_http_failures(),
            tcp_failures: default_tcp_failures(),
            timeouts: default_timeouts(),
        }
    }
}

fn default_unhealthy_statuses() -> Vec<u16> {
    vec![429, 404, 500, 501, 502, 503, 504, 505]
}

fn default_http_failures() -> u32 {
    5
}

fn default_tcp_failures() -> u32 {
    2
}

fn default_timeouts() -> u32 {
    3
}

/// Active probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCheck {
    /// Probe interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Path requested by the HTTP probe.
    #[serde(default = "default_http_path")]
    pub http_path: String,
    /// Host header override for probes; also part of the target key.
    #[serde(default)]
    pub host: Option<String>,
    /// Port override for probes.
    #[serde(default)]
    pub port: Option<u16>,
    /// Per-probe timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub healthy: HealthyThresholds,
    #[serde(default)]
    pub unhealthy: UnhealthyThresholds,
}

impl Default for ActiveCheck {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            http_path: default_http_path(),
            host: None,
            port: None,
            timeout: default_probe_timeout(),
            healthy: HealthyThresholds::default(),
            unhealthy: UnhealthyThresholds::default(),
        }
    }
}

fn default_interval() -> f64 {
    1.0
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_probe_timeout() -> f64 {
    1.0
}

/// Passive accounting configuration, applied to balancer reports.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PassiveCheck {
    #[serde(default)]
    pub healthy: HealthyThresholds,
    #[serde(default)]
    pub unhealthy: UnhealthyThresholds,
}

/// Health-check configuration for a cluster.
///
/// A checker is created for a cluster iff this is present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive: Option<PassiveCheck>,
}

/// An upstream cluster definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConf {
    /// Balancing policy: `roundrobin`, `chash`, or `ewma`. Kept as a
    /// name so an unrecognized policy surfaces at dispatch time rather
    /// than rejecting the whole configuration push.
    #[serde(rename = "type", default = "default_balancer")]
    pub lb: String,
    #[serde(default)]
    pub nodes: Vec<UpstreamNode>,
    /// When set, nodes are resolved through the discovery oracle at
    /// dispatch time and the static list is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Variable reference used as the consistent-hash key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthCheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConf>,
    /// Retry budget; defaults to `len(nodes) - 1` when unset or negative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    /// Key of the configuration object owning this upstream, used to
    /// attach checker cleanup when the upstream is standalone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
}

impl Default for UpstreamConf {
    fn default() -> Self {
        Self {
            lb: default_balancer(),
            nodes: Vec::new(),
            service_name: None,
            hash_on: None,
            checks: None,
            timeout: None,
            retries: None,
            parent_key: None,
        }
    }
}

impl UpstreamConf {
    /// Validates the cluster definition.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() && self.service_name.is_none() {
            return Err("upstream has neither nodes nor service_name".to_string());
        }
        // Overflow-checked so a picker never sees a wrapped total.
        self.nodes
            .iter()
            .try_fold(0u32, |acc, n| acc.checked_add(n.weight.max(1)))
            .ok_or_else(|| "total node weight overflows u32".to_string())?;
        Ok(())
    }
}

/// Comparison operator of a `vars` predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarOperator {
    #[serde(rename = "==")]
    Eq,
    /// Not-equal.
    #[serde(rename = "~=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    /// Regex match.
    #[serde(rename = "~~")]
    Regex,
    /// Membership in a list operand.
    #[serde(rename = "in")]
    In,
}

/// Right-hand side of a predicate: a scalar or a list (for `in`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Value(String),
    List(Vec<String>),
}

/// One attribute predicate: `(name, operator, operand)`.
///
/// All predicates on a route must hold (conjunction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarPredicate {
    pub name: String,
    pub op: VarOperator,
    pub operand: Operand,
}

/// A route definition as pushed by the configuration subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    /// URI patterns: exact, trailing-`*` prefix, or `:name` segments.
    pub paths: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    /// Host patterns, literal or leading `*.` wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    /// CIDR ranges the client address must fall in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addrs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Vec<VarPredicate>>,
    /// Name of a registered filter predicate; the route only matches if
    /// the filter returns true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConf>,
    /// Reference to an upstream resolved by the caller before `run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Route {
    pub fn new(id: impl Into<String>, paths: Vec<&str>) -> Self {
        Self {
            id: id.into(),
            paths: paths.into_iter().map(String::from).collect(),
            priority: 0,
            methods: None,
            hosts: None,
            remote_addrs: None,
            vars: None,
            filter: None,
            upstream: None,
            service: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balancer_type_field() {
        let conf: UpstreamConf = serde_yaml::from_str("type: chash\n").unwrap();
        assert_eq!(conf.lb, "chash");
        // Unknown names are accepted here; dispatch rejects them.
        let conf: UpstreamConf = serde_yaml::from_str("type: bogus\n").unwrap();
        assert_eq!(conf.lb, "bogus");
    }

    #[test]
    fn test_upstream_defaults() {
        let conf: UpstreamConf = serde_yaml::from_str(
            "nodes:\n  - host: 127.0.0.1\n    port: 8080\n",
        )
        .unwrap();
        assert_eq!(conf.lb, DEFAULT_BALANCER);
        assert_eq!(conf.nodes.len(), 1);
        assert_eq!(conf.nodes[0].weight, 1);
        assert!(conf.checks.is_none());
        assert!(conf.retries.is_none());
    }

    #[test]
    fn test_upstream_validate() {
        let empty = UpstreamConf::default();
        assert!(empty.validate().is_err());

        let with_service = UpstreamConf {
            service_name: Some("svc".to_string()),
            ..Default::default()
        };
        assert!(with_service.validate().is_ok());

        let overflow = UpstreamConf {
            nodes: vec![
                UpstreamNode::new("a", 80, u32::MAX),
                UpstreamNode::new("b", 80, 1),
            ],
            ..Default::default()
        };
        assert!(overflow.validate().is_err());
    }

    #[test]
    fn test_node_endpoint() {
        let node = UpstreamNode::new("10.0.0.1", 8080, 1);
        assert_eq!(node.endpoint(), "10.0.0.1:8080");
    }

    #[test]
    fn test_var_predicate_serde() {
        let pred: VarPredicate =
            serde_yaml::from_str("name: arg_x\nop: '=='\noperand: '1'\n").unwrap();
        assert_eq!(pred.op, VarOperator::Eq);
        assert_eq!(pred.operand, Operand::Value("1".to_string()));

        let pred: VarPredicate =
            serde_yaml::from_str("name: arg_x\nop: in\noperand: ['1', '2']\n").unwrap();
        assert_eq!(pred.op, VarOperator::In);
        assert_eq!(
            pred.operand,
            Operand::List(vec!["1".to_string(), "2".to_string()])
        );
    }

    #[test]
    fn test_health_check_defaults() {
        let checks: HealthCheckConfig =
            serde_yaml::from_str("active:\n  http_path: /status\n").unwrap();
        let active = checks.active.unwrap();
        assert_eq!(active.http_path, "/status");
        assert_eq!(active.healthy.successes, 2);
        assert_eq!(active.unhealthy.tcp_failures, 2);
        assert!(active.healthy.http_statuses.contains(&200));
        assert!(checks.passive.is_none());
    }

    #[test]
    fn test_route_serde_roundtrip() {
        let route = Route {
            methods: Some(vec!["GET".to_string()]),
            hosts: Some(vec!["*.example.com".to_string()]),
            priority: 5,
            ..Route::new("r1", vec!["/api/*"])
        };
        let yaml = serde_yaml::to_string(&route).unwrap();
        let parsed: Route = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, route);
    }
}
