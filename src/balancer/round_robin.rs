//! Smooth weighted round-robin.
//!
//! Produces each endpoint at a frequency proportional to its weight
//! while interleaving picks to minimize run lengths (the nginx
//! algorithm). Deterministic from a fixed starting state.

use std::sync::{Arc, Mutex};

use crate::ctx::RequestContext;
use crate::error::DispatchError;

use super::picker::Picker;

struct Peer {
    endpoint: Arc<str>,
    weight: i64,
}

pub struct RoundRobinPicker {
    peers: Vec<Peer>,
    /// Current weight per peer; mutated on every pick.
    current: Mutex<Vec<i64>>,
    total: i64,
}

impl RoundRobinPicker {
    pub fn new(endpoints: &[(String, u32)]) -> Self {
        let peers: Vec<Peer> = endpoints
            .iter()
            .map(|(endpoint, weight)| Peer {
                endpoint: Arc::from(endpoint.as_str()),
                // A zero weight still gets an occasional turn.
                weight: i64::from((*weight).max(1)),
            })
            .collect();
        let total = peers.iter().map(|p| p.weight).sum();

        Self {
            current: Mutex::new(vec![0; peers.len()]),
            peers,
            total,
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _ctx: &mut RequestContext) -> Result<Arc<str>, DispatchError> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut best: Option<usize> = None;
        for (i, peer) in self.peers.iter().enumerate() {
            current[i] += peer.weight;
            match best {
                Some(b) if current[i] <= current[b] => {}
                _ => best = Some(i),
            }
        }

        let best = best.ok_or(DispatchError::PickerExhausted)?;
        current[best] -= self.total;
        Ok(self.peers[best].endpoint.clone())
    }

    fn nodes(&self) -> Vec<(Arc<str>, u32)> {
        self.peers
            .iter()
            .map(|p| (p.endpoint.clone(), p.weight as u32))
            .collect()
    }
}
