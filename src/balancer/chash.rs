//! Consistent hashing.
//!
//! A ring of virtual points, 160 per weight unit, hashed with ahash.
//! The per-request key is a variable reference evaluated against the
//! context (`remote_addr` when unset); the pick is the ring successor,
//! so a fixed key keeps landing on the same endpoint while the ring is
//! unchanged.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

use crate::ctx::RequestContext;
use crate::error::DispatchError;

use super::picker::Picker;

/// Virtual points per weight unit.
const POINTS_PER_WEIGHT: u32 = 160;

/// Hash key used when the cluster does not configure one.
const DEFAULT_HASH_ON: &str = "remote_addr";

pub struct ChashPicker {
    ring: BTreeMap<u64, Arc<str>>,
    endpoints: Vec<(Arc<str>, u32)>,
    hash_on: String,
}

impl ChashPicker {
    pub fn new(endpoints: &[(String, u32)], hash_on: Option<&str>) -> Self {
        let endpoints: Vec<(Arc<str>, u32)> = endpoints
            .iter()
            .map(|(e, w)| (Arc::<str>::from(e.as_str()), *w))
            .collect();

        let mut ring = BTreeMap::new();
        for (endpoint, weight) in &endpoints {
            let points = (*weight).max(1) * POINTS_PER_WEIGHT;
            for replica in 0..points {
                let point = hash_bytes(format!("{endpoint}#{replica}").as_bytes());
                ring.insert(point, endpoint.clone());
            }
        }

        Self {
            ring,
            endpoints,
            hash_on: hash_on.unwrap_or(DEFAULT_HASH_ON).to_string(),
        }
    }

    fn successor(&self, point: u64) -> Option<Arc<str>> {
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, endpoint)| endpoint.clone())
    }
}

impl Picker for ChashPicker {
    fn pick(&self, ctx: &mut RequestContext) -> Result<Arc<str>, DispatchError> {
        let key = ctx.var(&self.hash_on).unwrap_or_default();
        let point = hash_bytes(key.as_bytes());
        self.successor(point).ok_or(DispatchError::PickerExhausted)
    }

    fn nodes(&self) -> Vec<(Arc<str>, u32)> {
        self.endpoints.clone()
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = ahash::AHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::collections::HashSet;

    fn make_ctx(remote: &str) -> RequestContext {
        RequestContext::new(Method::GET, "h", "/", remote.parse().unwrap())
    }

    fn endpoints(n: usize) -> Vec<(String, u32)> {
        (0..n).map(|i| (format!("10.0.0.{i}:80"), 1)).collect()
    }

    #[test]
    fn test_same_key_same_endpoint() {
        let picker = ChashPicker::new(&endpoints(4), None);

        let mut first = None;
        for _ in 0..10 {
            let mut ctx = make_ctx("10.1.2.3");
            let picked = picker.pick(&mut ctx).unwrap();
            match &first {
                None => first = Some(picked),
                Some(expected) => assert_eq!(&picked, expected),
            }
        }
    }

    #[test]
    fn test_keys_spread_across_endpoints() {
        let picker = ChashPicker::new(&endpoints(4), None);

        let mut seen = HashSet::new();
        for i in 0..64u8 {
            let mut ctx = make_ctx(&format!("10.9.{i}.1"));
            seen.insert(picker.pick(&mut ctx).unwrap().to_string());
        }
        // 64 distinct keys over 4 endpoints with 160 points each
        // land on more than one endpoint.
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_configured_hash_key() {
        let picker = ChashPicker::new(&endpoints(4), Some("arg_session"));

        let pick_for = |session: &str| {
            let mut ctx = make_ctx("10.1.2.3").with_arg("session", session);
            picker.pick(&mut ctx).unwrap().to_string()
        };

        assert_eq!(pick_for("s-1"), pick_for("s-1"));
        // Different remote addresses do not change the pick when the
        // key comes from a query argument.
        let mut other = make_ctx("10.9.9.9").with_arg("session", "s-1");
        assert_eq!(picker.pick(&mut other).unwrap().to_string(), pick_for("s-1"));
    }

    #[test]
    fn test_unchanged_ring_stable_after_rebuild() {
        // Rebuilding from the identical endpoint list keeps the mapping.
        let a = ChashPicker::new(&endpoints(4), None);
        let b = ChashPicker::new(&endpoints(4), None);

        for i in 0..16u8 {
            let mut ctx_a = make_ctx(&format!("172.16.{i}.1"));
            let mut ctx_b = make_ctx(&format!("172.16.{i}.1"));
            assert_eq!(a.pick(&mut ctx_a).unwrap(), b.pick(&mut ctx_b).unwrap());
        }
    }

    #[test]
    fn test_node_removal_only_remaps_its_keys() {
        let full = ChashPicker::new(&endpoints(4), None);
        let reduced = ChashPicker::new(&endpoints(4)[..3], None);
        let dropped = "10.0.0.3:80";

        for i in 0..64u8 {
            let addr = format!("192.168.{i}.7");
            let mut ctx_full = make_ctx(&addr);
            let mut ctx_reduced = make_ctx(&addr);
            let before = full.pick(&mut ctx_full).unwrap();
            let after = reduced.pick(&mut ctx_reduced).unwrap();
            if &*before != dropped {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_weight_scales_virtual_points() {
        let picker = ChashPicker::new(
            &[("heavy:80".to_string(), 3), ("light:80".to_string(), 1)],
            None,
        );
        let mut heavy = 0u32;
        for i in 0..200u8 {
            let mut ctx = make_ctx(&format!("10.20.{i}.9"));
            if &*picker.pick(&mut ctx).unwrap() == "heavy:80" {
                heavy += 1;
            }
        }
        // Rough proportionality is enough; the ring is not exact.
        assert!(heavy > 100, "heavy endpoint got {heavy}/200 picks");
    }

    #[test]
    fn test_empty_ring_errors() {
        let picker = ChashPicker::new(&[], None);
        let mut ctx = make_ctx("10.0.0.1");
        assert!(matches!(
            picker.pick(&mut ctx),
            Err(DispatchError::PickerExhausted)
        ));
    }
}
