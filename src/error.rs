//! Error types for the dispatch core.

use thiserror::Error;

/// Errors surfaced by the balancer and dispatcher.
///
/// Configuration errors and transient errors are both answered with a 502
/// by the dispatcher wrapper; the distinction only matters for logging.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("discovery is uninitialized")]
    DiscoveryUninitialized,

    #[error("no valid upstream node")]
    NoValidNode,

    #[error("invalid balancer type: {0}")]
    InvalidBalancerType(String),

    #[error("failed to find valid upstream server")]
    PickerExhausted,

    #[error("invalid upstream address: {0}")]
    AddressParse(String),

    #[error("failed to set upstream peer: {0}")]
    SetPeer(String),
}

impl DispatchError {
    /// Whether the error stems from configuration rather than runtime state.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            DispatchError::DiscoveryUninitialized
                | DispatchError::NoValidNode
                | DispatchError::InvalidBalancerType(_)
        )
    }
}

/// Errors raised while compiling a route during a trie rebuild.
///
/// The offending route is skipped and logged; other routes remain usable.
#[derive(Debug, Error)]
pub enum RouteCompileError {
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("invalid regex '{pattern}' in predicate '{name}': {source}")]
    BadRegex {
        name: String,
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid CIDR '{0}'")]
    BadCidr(String),
}
