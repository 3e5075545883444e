//! EWMA picker.
//!
//! Tracks a time-decayed exponentially-weighted moving average of
//! response latency per endpoint. Each pick takes the endpoint with the
//! minimum `ewma * (inflight + 1)` score, ties broken by weight;
//! inflight rises on pick and falls when the post-request hook reports
//! the attempt's latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ctx::RequestContext;
use crate::error::DispatchError;

use super::picker::Picker;

/// Decay time constant: a sample from one constant ago weighs 1/e.
const DECAY: Duration = Duration::from_secs(10);

/// Latency charged to a failed attempt, so failures push an endpoint's
/// score up without a dedicated error counter.
const FAILURE_PENALTY_MS: f64 = 10_000.0;

/// Floor for the latency term so inflight still orders endpoints that
/// have no samples yet.
const MIN_LATENCY_MS: f64 = 0.001;

struct Latency {
    ewma_ms: f64,
    updated: Instant,
    initialized: bool,
}

struct EwmaNode {
    endpoint: Arc<str>,
    weight: u32,
    latency: Mutex<Latency>,
    inflight: AtomicUsize,
}

impl EwmaNode {
    fn score(&self) -> f64 {
        let latency = self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let inflight = self.inflight.load(Ordering::Relaxed) as f64;
        latency.ewma_ms.max(MIN_LATENCY_MS) * (inflight + 1.0)
    }

    fn observe(&self, sample_ms: f64) {
        let mut latency = self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if !latency.initialized {
            latency.ewma_ms = sample_ms;
            latency.initialized = true;
        } else {
            let elapsed = now.duration_since(latency.updated);
            let decay = (-elapsed.as_secs_f64() / DECAY.as_secs_f64()).exp();
            latency.ewma_ms = latency.ewma_ms * decay + sample_ms * (1.0 - decay);
        }
        latency.updated = now;
    }
}

pub struct EwmaPicker {
    nodes: Vec<EwmaNode>,
}

impl EwmaPicker {
    pub fn new(endpoints: &[(String, u32)]) -> Self {
        let now = Instant::now();
        let nodes = endpoints
            .iter()
            .map(|(endpoint, weight)| EwmaNode {
                endpoint: Arc::from(endpoint.as_str()),
                weight: (*weight).max(1),
                latency: Mutex::new(Latency {
                    ewma_ms: 0.0,
                    updated: now,
                    initialized: false,
                }),
                inflight: AtomicUsize::new(0),
            })
            .collect();
        Self { nodes }
    }

    fn node_for(&self, endpoint: &str) -> Option<&EwmaNode> {
        self.nodes.iter().find(|n| &*n.endpoint == endpoint)
    }
}

impl Picker for EwmaPicker {
    fn pick(&self, _ctx: &mut RequestContext) -> Result<Arc<str>, DispatchError> {
        let mut best: Option<(&EwmaNode, f64)> = None;
        for node in &self.nodes {
            let score = node.score();
            let better = match &best {
                None => true,
                Some((incumbent, incumbent_score)) => {
                    score < *incumbent_score
                        || (score == *incumbent_score && node.weight > incumbent.weight)
                }
            };
            if better {
                best = Some((node, score));
            }
        }

        let (node, _) = best.ok_or(DispatchError::PickerExhausted)?;
        node.inflight.fetch_add(1, Ordering::Relaxed);
        Ok(node.endpoint.clone())
    }

    fn after_balance(&self, ctx: &mut RequestContext, latency: Duration, failed: bool) {
        let (Some(ip), Some(port)) = (&ctx.balancer.ip, ctx.balancer.port) else {
            return;
        };
        let endpoint = format!("{ip}:{port}");
        let Some(node) = self.node_for(&endpoint) else {
            return;
        };

        // Balanced against the increment in pick; floor at zero in case
        // the hook fires for an attempt a previous picker served.
        let _ = node
            .inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });

        let sample_ms = if failed {
            FAILURE_PENALTY_MS
        } else {
            latency.as_secs_f64() * 1000.0
        };
        node.observe(sample_ms);
    }

    fn nodes(&self) -> Vec<(Arc<str>, u32)> {
        self.nodes
            .iter()
            .map(|n| (n.endpoint.clone(), n.weight))
            .collect()
    }
}
