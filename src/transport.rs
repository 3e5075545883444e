//! Transport and discovery seams.
//!
//! The dispatch core never touches sockets for request traffic; it
//! drives the HTTP transport through these hooks and learns about the
//! previous attempt's fate from `get_last_failure`. Discovery supplies
//! node lists for clusters that name a service instead of listing
//! endpoints.

use http::StatusCode;

use crate::config::UpstreamNode;

/// Outcome classification of the previous attempt, as the transport
/// saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureState {
    /// The upstream answered, but the transport decided to try the
    /// next endpoint (the code is the response status).
    Next,
    /// The exchange failed outright (the code is the failure status,
    /// 504 for timeouts).
    Failed,
}

/// Hooks the core calls on the HTTP transport while dispatching.
pub trait Transport {
    /// Applies per-cluster socket timeouts (seconds, per phase).
    fn set_timeouts(&mut self, connect: f64, send: f64, read: f64);

    /// Configures the retry budget for this request.
    fn set_more_tries(&mut self, tries: u32);

    /// Hands the chosen endpoint to the transport.
    fn set_current_peer(&mut self, host: &str, port: u16) -> Result<(), String>;

    /// State and status code of the previous attempt, if any.
    fn get_last_failure(&self) -> Option<(FailureState, u16)>;

    /// Short-circuits the request with a status code.
    fn respond(&mut self, status: StatusCode);
}

/// Service-discovery oracle.
///
/// `None` means the discovery subsystem has no answer for the service
/// yet (uninitialized); an empty list means the service has no nodes.
pub trait Discovery: Send + Sync {
    fn nodes(&self, service_name: &str) -> Option<Vec<UpstreamNode>>;
}
