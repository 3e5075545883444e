//! Server picker interface.
//!
//! A picker selects one endpoint from a cluster's healthy subset. It is
//! built against a fixed weighted endpoint list and cached until the
//! cluster configuration or health status version moves.

use std::sync::Arc;
use std::time::Duration;

use crate::config::UpstreamConf;
use crate::ctx::RequestContext;
use crate::error::DispatchError;

use super::chash::ChashPicker;
use super::ewma::EwmaPicker;
use super::round_robin::RoundRobinPicker;

/// Stateful endpoint selector for one cluster.
pub trait Picker: Send + Sync {
    /// Selects an endpoint (`"host:port"`). The context is passed so
    /// policies can derive per-request keys from it.
    fn pick(&self, ctx: &mut RequestContext) -> Result<Arc<str>, DispatchError>;

    /// Post-request hook: observed latency and outcome of the attempt
    /// served by this picker. Only EWMA uses it.
    fn after_balance(&self, _ctx: &mut RequestContext, _latency: Duration, _failed: bool) {}

    /// Current endpoint view with weights.
    fn nodes(&self) -> Vec<(Arc<str>, u32)>;
}

impl std::fmt::Debug for dyn Picker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Picker")
    }
}

/// Constructs a picker of the configured type over a weighted endpoint
/// list. The list order is preserved: round-robin sequences are
/// deterministic from a fixed starting state.
pub(crate) fn build_picker(
    conf: &UpstreamConf,
    endpoints: &[(String, u32)],
) -> Result<Arc<dyn Picker>, DispatchError> {
    match conf.lb.as_str() {
        "roundrobin" => Ok(Arc::new(RoundRobinPicker::new(endpoints))),
        "chash" => Ok(Arc::new(ChashPicker::new(
            endpoints,
            conf.hash_on.as_deref(),
        ))),
        "ewma" => Ok(Arc::new(EwmaPicker::new(endpoints))),
        other => Err(DispatchError::InvalidBalancerType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn make_ctx() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "example.com",
            "/",
            "10.0.0.1".parse().unwrap(),
        )
    }

    #[test]
    fn test_factory_builds_each_type() {
        let endpoints = vec![("a:80".to_string(), 1), ("b:80".to_string(), 1)];

        for lb in ["roundrobin", "chash", "ewma"] {
            let conf = UpstreamConf {
                lb: lb.to_string(),
                ..Default::default()
            };
            let picker = build_picker(&conf, &endpoints).unwrap();
            assert_eq!(picker.nodes().len(), 2);
            let mut ctx = make_ctx();
            assert!(picker.pick(&mut ctx).is_ok());
        }
    }

    #[test]
    fn test_factory_rejects_unknown_type() {
        let endpoints = vec![("a:80".to_string(), 1)];
        let conf = UpstreamConf {
            lb: "least_conn".to_string(),
            ..Default::default()
        };
        let err = build_picker(&conf, &endpoints).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidBalancerType(_)));
        assert_eq!(err.to_string(), "invalid balancer type: least_conn");
    }
}
