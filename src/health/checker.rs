//! Per-cluster health checking.
//!
//! Each checker owns the health state of one cluster's endpoints in a
//! process-wide shared region (all workers observe the same state) and
//! is fed from two sides: the active prober and the balancer's passive
//! reports. Transitions that change an endpoint's eligibility bump
//! `status_ver`, the token the balancer uses to invalidate picker
//! caches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::config::{
    ActiveCheck, HealthCheckConfig, HealthyThresholds, UnhealthyThresholds, UpstreamNode,
};

use super::probe;

/// Health state of one endpoint.
///
/// The intermediate states exist so a single report in either direction
/// does not flip a settled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Healthy,
    MostlyHealthy,
    MostlyUnhealthy,
    Unhealthy,
}

impl TargetStatus {
    /// Whether the endpoint is eligible for picking.
    pub fn is_available(self) -> bool {
        matches!(self, TargetStatus::Healthy | TargetStatus::MostlyHealthy)
    }
}

/// Identity of a probed endpoint: host, port, and probe hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub host: String,
    pub port: u16,
    pub hostname: Option<String>,
}

impl TargetKey {
    pub fn new(host: &str, port: u16, hostname: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            port,
            hostname: hostname.map(String::from),
        }
    }
}

/// Which failure counter a report advances.
#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Timeout,
    Tcp,
    Http,
}

#[derive(Debug, Clone)]
struct TargetState {
    status: TargetStatus,
    successes: u32,
    timeouts: u32,
    tcp_failures: u32,
    http_failures: u32,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            status: TargetStatus::Healthy,
            successes: 0,
            timeouts: 0,
            tcp_failures: 0,
            http_failures: 0,
        }
    }
}

/// Counter snapshot for one endpoint.
#[derive(Debug, Clone)]
pub struct TargetMetrics {
    pub status: TargetStatus,
    pub successes: u32,
    pub timeouts: u32,
    pub tcp_failures: u32,
    pub http_failures: u32,
}

/// Result of one active probe, classified by the prober.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ProbeResult {
    Status(u16),
    ConnectFailed,
    TimedOut,
}

/// Active + passive health checker for one upstream cluster.
pub struct HealthChecker {
    name: String,
    config: HealthCheckConfig,
    targets: DashMap<TargetKey, TargetState>,
    status_ver: AtomicU64,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    /// Creates a checker for `nodes` and starts the active prober when
    /// an async runtime is available and active checks are configured.
    pub fn new(name: &str, config: HealthCheckConfig, nodes: &[UpstreamNode]) -> Arc<Self> {
        let checker = Arc::new(Self {
            name: name.to_string(),
            config,
            targets: DashMap::new(),
            status_ver: AtomicU64::new(0),
            prober: Mutex::new(None),
        });

        for node in nodes {
            checker.add_target(&node.host, node.port);
        }

        let handle = probe::spawn(&checker);
        *checker
            .prober
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;

        checker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Hostname the probes (and passive reports) are keyed under.
    pub fn probe_hostname(&self) -> Option<&str> {
        self.config
            .active
            .as_ref()
            .and_then(|a| a.host.as_deref())
    }

    /// Registers an endpoint, initially healthy.
    pub fn add_target(&self, host: &str, port: u16) {
        let key = TargetKey::new(host, port, self.probe_hostname());
        self.targets.entry(key).or_default();
    }

    pub(crate) fn target_keys(&self) -> Vec<TargetKey> {
        self.targets.iter().map(|e| e.key().clone()).collect()
    }

    /// Monotonic token bumped whenever an endpoint's eligibility flips.
    pub fn status_ver(&self) -> u64 {
        self.status_ver.load(Ordering::SeqCst)
    }

    /// True iff the endpoint is `healthy` or `mostly_healthy`.
    ///
    /// Unknown endpoints are considered healthy.
    pub fn get_target_status(&self, host: &str, port: u16, hostname: Option<&str>) -> bool {
        let key = TargetKey::new(host, port, hostname);
        self.targets
            .get(&key)
            .map(|state| state.status.is_available())
            .unwrap_or(true)
    }

    /// Counter snapshot for one endpoint.
    pub fn metrics(&self, host: &str, port: u16, hostname: Option<&str>) -> Option<TargetMetrics> {
        let key = TargetKey::new(host, port, hostname);
        self.targets.get(&key).map(|state| TargetMetrics {
            status: state.status,
            successes: state.successes,
            timeouts: state.timeouts,
            tcp_failures: state.tcp_failures,
            http_failures: state.http_failures,
        })
    }

    // ----- passive reports (driven by the balancer) -----

    /// Previous attempt timed out against the upstream.
    pub fn report_timeout(&self, host: &str, port: u16, hostname: Option<&str>) {
        let key = TargetKey::new(host, port, hostname);
        let threshold = self.passive_unhealthy().timeouts;
        self.record_failure(&key, FailureKind::Timeout, threshold);
    }

    /// Previous attempt failed to establish or complete the TCP exchange.
    pub fn report_tcp_failure(&self, host: &str, port: u16, hostname: Option<&str>) {
        let key = TargetKey::new(host, port, hostname);
        let threshold = self.passive_unhealthy().tcp_failures;
        self.record_failure(&key, FailureKind::Tcp, threshold);
    }

    /// Previous attempt returned `status`; classified per the passive
    /// thresholds (statuses outside both sets are ignored).
    pub fn report_http_status(&self, host: &str, port: u16, hostname: Option<&str>, status: u16) {
        let key = TargetKey::new(host, port, hostname);
        if self.passive_unhealthy().http_statuses.contains(&status) {
            let threshold = self.passive_unhealthy().http_failures;
            self.record_failure(&key, FailureKind::Http, threshold);
        } else if self.passive_healthy().http_statuses.contains(&status) {
            let threshold = self.passive_healthy().successes;
            self.record_success(&key, threshold);
        }
    }

    // ----- active probe results -----

    pub(crate) fn apply_probe(&self, key: &TargetKey, result: ProbeResult) {
        let Some(active) = &self.config.active else {
            return;
        };
        match result {
            ProbeResult::Status(status) if active.healthy.http_statuses.contains(&status) => {
                self.record_success(key, active.healthy.successes);
            }
            ProbeResult::Status(_) => {
                self.record_failure(key, FailureKind::Http, active.unhealthy.http_failures);
            }
            ProbeResult::ConnectFailed => {
                self.record_failure(key, FailureKind::Tcp, active.unhealthy.tcp_failures);
            }
            ProbeResult::TimedOut => {
                self.record_failure(key, FailureKind::Timeout, active.unhealthy.timeouts);
            }
        }
    }

    // ----- subset selection -----

    /// Endpoints currently eligible for picking.
    ///
    /// When every endpoint reports unhealthy the full list is returned:
    /// losing a request to an outage is worse than trying a
    /// probably-bad node.
    pub fn healthy_subset(&self, nodes: &[UpstreamNode]) -> Vec<UpstreamNode> {
        let hostname = self.probe_hostname();
        let healthy: Vec<UpstreamNode> = nodes
            .iter()
            .filter(|n| self.get_target_status(&n.host, n.port, hostname))
            .cloned()
            .collect();

        if healthy.is_empty() {
            tracing::warn!(
                checker = %self.name,
                "all endpoints unhealthy, falling back to full node list"
            );
            return nodes.to_vec();
        }
        healthy
    }

    /// Stops the active prober. Called by the registry's cleanup when
    /// the checker is evicted.
    pub fn stop(&self) {
        let handle = self
            .prober
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!(checker = %self.name, "active prober stopped");
        }
    }

    // ----- state machine -----

    fn record_success(&self, key: &TargetKey, threshold: u32) {
        let mut entry = self.targets.entry(key.clone()).or_default();
        entry.timeouts = 0;
        entry.tcp_failures = 0;
        entry.http_failures = 0;
        entry.successes = entry.successes.saturating_add(1);

        let next = if entry.successes >= threshold {
            TargetStatus::Healthy
        } else {
            match entry.status {
                TargetStatus::Unhealthy => TargetStatus::MostlyUnhealthy,
                current => current,
            }
        };
        self.transition(key, &mut entry, next);
    }

    fn record_failure(&self, key: &TargetKey, kind: FailureKind, threshold: u32) {
        let mut entry = self.targets.entry(key.clone()).or_default();
        entry.successes = 0;
        let counter = match kind {
            FailureKind::Timeout => {
                entry.timeouts = entry.timeouts.saturating_add(1);
                entry.timeouts
            }
            FailureKind::Tcp => {
                entry.tcp_failures = entry.tcp_failures.saturating_add(1);
                entry.tcp_failures
            }
            FailureKind::Http => {
                entry.http_failures = entry.http_failures.saturating_add(1);
                entry.http_failures
            }
        };

        let next = if counter >= threshold {
            TargetStatus::Unhealthy
        } else {
            match entry.status {
                TargetStatus::Healthy => TargetStatus::MostlyHealthy,
                current => current,
            }
        };
        self.transition(key, &mut entry, next);
    }

    fn transition(&self, key: &TargetKey, entry: &mut TargetState, next: TargetStatus) {
        if entry.status == next {
            return;
        }
        // The version word only moves when the endpoint's eligibility
        // changes; drifting between healthy and mostly_healthy must not
        // invalidate pickers mid-retry.
        let flipped = entry.status.is_available() != next.is_available();
        entry.status = next;
        if flipped {
            self.status_ver.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                checker = %self.name,
                host = %key.host,
                port = key.port,
                status = ?next,
                "endpoint status changed"
            );
        }
    }

    fn passive_healthy(&self) -> &HealthyThresholds {
        static DEFAULT: std::sync::OnceLock<HealthyThresholds> = std::sync::OnceLock::new();
        self.config
            .passive
            .as_ref()
            .map(|p| &p.healthy)
            .or_else(|| self.config.active.as_ref().map(|a| &a.healthy))
            .unwrap_or_else(|| DEFAULT.get_or_init(HealthyThresholds::default))
    }

    fn passive_unhealthy(&self) -> &UnhealthyThresholds {
        static DEFAULT: std::sync::OnceLock<UnhealthyThresholds> = std::sync::OnceLock::new();
        self.config
            .passive
            .as_ref()
            .map(|p| &p.unhealthy)
            .or_else(|| self.config.active.as_ref().map(|a| &a.unhealthy))
            .unwrap_or_else(|| DEFAULT.get_or_init(UnhealthyThresholds::default))
    }

    /// Probe parameters, if active checks are configured.
    pub(crate) fn active(&self) -> Option<&ActiveCheck> {
        self.config.active.as_ref()
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassiveCheck;

    fn make_checker(tcp_failures: u32, successes: u32) -> Arc<HealthChecker> {
        let config = HealthCheckConfig {
            active: None,
            passive: Some(PassiveCheck {
                healthy: HealthyThresholds {
                    http_statuses: vec![200, 302],
                    successes,
                },
                unhealthy: UnhealthyThresholds {
                    http_statuses: vec![500, 502, 503, 504],
                    http_failures: tcp_failures,
                    tcp_failures,
                    timeouts: tcp_failures,
                },
            }),
        };
        let nodes = vec![
            UpstreamNode::new("10.0.0.1", 80, 1),
            UpstreamNode::new("10.0.0.2", 80, 1),
        ];
        HealthChecker::new("test", config, &nodes)
    }

    // ========== Phase 1: Initial State ==========

    #[test]
    fn test_targets_start_healthy() {
        let checker = make_checker(2, 2);
        assert!(checker.get_target_status("10.0.0.1", 80, None));
        assert!(checker.get_target_status("10.0.0.2", 80, None));
        // Unknown endpoints are considered healthy.
        assert!(checker.get_target_status("10.0.0.9", 80, None));
        assert_eq!(checker.status_ver(), 0);
    }

    // ========== Phase 2: Failure Transitions ==========

    #[test]
    fn test_single_failure_does_not_flip() {
        let checker = make_checker(2, 2);
        checker.report_tcp_failure("10.0.0.1", 80, None);

        // mostly_healthy still counts as available, and the picker
        // invalidation token does not move for it.
        assert!(checker.get_target_status("10.0.0.1", 80, None));
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.status, TargetStatus::MostlyHealthy);
        assert_eq!(checker.status_ver(), 0);
    }

    #[test]
    fn test_threshold_failures_turn_unhealthy() {
        let checker = make_checker(2, 2);
        checker.report_tcp_failure("10.0.0.1", 80, None);
        checker.report_tcp_failure("10.0.0.1", 80, None);

        assert!(!checker.get_target_status("10.0.0.1", 80, None));
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.status, TargetStatus::Unhealthy);
    }

    #[test]
    fn test_failure_kinds_counted_separately() {
        let checker = make_checker(3, 2);
        checker.report_tcp_failure("10.0.0.1", 80, None);
        checker.report_timeout("10.0.0.1", 80, None);
        checker.report_tcp_failure("10.0.0.1", 80, None);

        // No single kind reached its threshold of 3.
        assert!(checker.get_target_status("10.0.0.1", 80, None));
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.tcp_failures, 2);
        assert_eq!(metrics.timeouts, 1);
    }

    // ========== Phase 3: Recovery Transitions ==========

    #[test]
    fn test_recovery_passes_through_mostly_unhealthy() {
        let checker = make_checker(2, 2);
        checker.report_tcp_failure("10.0.0.1", 80, None);
        checker.report_tcp_failure("10.0.0.1", 80, None);
        assert!(!checker.get_target_status("10.0.0.1", 80, None));

        checker.report_http_status("10.0.0.1", 80, None, 200);
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.status, TargetStatus::MostlyUnhealthy);
        assert!(!checker.get_target_status("10.0.0.1", 80, None));

        checker.report_http_status("10.0.0.1", 80, None, 200);
        assert!(checker.get_target_status("10.0.0.1", 80, None));
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.status, TargetStatus::Healthy);
    }

    #[test]
    fn test_success_resets_failure_counters() {
        let checker = make_checker(2, 2);
        checker.report_tcp_failure("10.0.0.1", 80, None);
        checker.report_http_status("10.0.0.1", 80, None, 200);
        checker.report_tcp_failure("10.0.0.1", 80, None);

        // The counter restarted, so one more failure is still short of 2.
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.tcp_failures, 1);
    }

    #[test]
    fn test_neutral_status_ignored() {
        let checker = make_checker(2, 2);
        // 301 is in neither the healthy nor the unhealthy status set.
        checker.report_http_status("10.0.0.1", 80, None, 301);
        let metrics = checker.metrics("10.0.0.1", 80, None).unwrap();
        assert_eq!(metrics.status, TargetStatus::Healthy);
        assert_eq!(metrics.successes, 0);
        assert_eq!(checker.status_ver(), 0);
    }

    #[test]
    fn test_unhealthy_http_status_counts_as_failure() {
        let checker = make_checker(2, 2);
        checker.report_http_status("10.0.0.1", 80, None, 502);
        checker.report_http_status("10.0.0.1", 80, None, 502);
        assert!(!checker.get_target_status("10.0.0.1", 80, None));
    }

    // ========== Phase 4: status_ver ==========

    #[test]
    fn test_status_ver_tracks_eligibility_flips() {
        let checker = make_checker(2, 2);
        let v0 = checker.status_ver();

        // healthy -> mostly_healthy: still eligible, no bump.
        checker.report_tcp_failure("10.0.0.1", 80, None);
        assert_eq!(checker.status_ver(), v0);

        // mostly_healthy -> unhealthy: eligibility flipped.
        checker.report_tcp_failure("10.0.0.1", 80, None);
        let v1 = checker.status_ver();
        assert!(v1 > v0);

        // A repeat failure in the same state does not bump.
        checker.report_tcp_failure("10.0.0.1", 80, None);
        assert_eq!(checker.status_ver(), v1);

        // unhealthy -> mostly_unhealthy: still ineligible, no bump.
        checker.report_http_status("10.0.0.1", 80, None, 200);
        assert_eq!(checker.status_ver(), v1);

        // mostly_unhealthy -> healthy: eligibility flipped back.
        checker.report_http_status("10.0.0.1", 80, None, 200);
        assert!(checker.status_ver() > v1);
    }

    // ========== Phase 5: Healthy Subset ==========

    #[test]
    fn test_healthy_subset_filters_unhealthy() {
        let checker = make_checker(2, 2);
        let nodes = vec![
            UpstreamNode::new("10.0.0.1", 80, 1),
            UpstreamNode::new("10.0.0.2", 80, 1),
        ];

        checker.report_tcp_failure("10.0.0.2", 80, None);
        checker.report_tcp_failure("10.0.0.2", 80, None);

        let subset = checker.healthy_subset(&nodes);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].host, "10.0.0.1");
    }

    #[test]
    fn test_empty_subset_falls_back_to_full_list() {
        let checker = make_checker(2, 2);
        let nodes = vec![
            UpstreamNode::new("10.0.0.1", 80, 1),
            UpstreamNode::new("10.0.0.2", 80, 1),
        ];

        for host in ["10.0.0.1", "10.0.0.2"] {
            checker.report_tcp_failure(host, 80, None);
            checker.report_tcp_failure(host, 80, None);
        }

        let subset = checker.healthy_subset(&nodes);
        assert_eq!(subset.len(), 2);
    }

    // ========== Phase 6: Concurrency ==========

    #[test]
    fn test_concurrent_reports() {
        use std::thread;

        let checker = make_checker(3, 2);
        let mut handles = vec![];
        for i in 0..8 {
            let checker = checker.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        checker.report_tcp_failure("10.0.0.1", 80, None);
                    } else {
                        checker.report_http_status("10.0.0.1", 80, None, 200);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // The state machine stayed consistent under contention.
        assert!(checker.metrics("10.0.0.1", 80, None).is_some());
    }
}
