//! Balancer (§4.10, §9 Dynamic dispatch): picks one instance out of a
//! `Resolver` snapshot. A capability trait, not an inheritance hierarchy —
//! Login uses it to pick a Gateway node for the handoff address.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::registry::ServiceInfo;

pub trait Balancer: Send + Sync {
    /// Returns `None` if `candidates` is empty.
    fn pick<'a>(&self, candidates: &'a [ServiceInfo]) -> Option<&'a ServiceInfo>;
}

#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl Balancer for RoundRobin {
    fn pick<'a>(&self, candidates: &'a [ServiceInfo]) -> Option<&'a ServiceInfo> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(i)
    }
}

#[derive(Default)]
pub struct Random;

impl Balancer for Random {
    fn pick<'a>(&self, candidates: &'a [ServiceInfo]) -> Option<&'a ServiceInfo> {
        if candidates.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instances(n: usize) -> Vec<ServiceInfo> {
        (0..n)
            .map(|i| ServiceInfo { name: "game".into(), address: format!("10.0.0.{i}:7000"), metadata: HashMap::new() })
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_every_candidate() {
        let rr = RoundRobin::default();
        let candidates = instances(3);
        let picks: Vec<_> = (0..6).map(|_| rr.pick(&candidates).unwrap().address.clone()).collect();
        assert_eq!(picks, vec![
            "10.0.0.0:7000", "10.0.0.1:7000", "10.0.0.2:7000",
            "10.0.0.0:7000", "10.0.0.1:7000", "10.0.0.2:7000",
        ]);
    }

    #[test]
    fn empty_candidates_yields_none() {
        let rr = RoundRobin::default();
        assert!(rr.pick(&[]).is_none());
        assert!(Random.pick(&[]).is_none());
    }
}
