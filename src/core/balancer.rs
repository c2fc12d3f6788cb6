//! Upstream target selection strategies.
//!
//! A balancer elects one target out of a backend's host list. Selection runs
//! in the request hot path, so implementations are lock-free: round-robin
//! uses an atomic counter, weighted election a thread-local RNG. Single
//! target lists short-circuit to a no-op balancer.
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::models::BalancingMode;

/// One election candidate: an upstream base URL and its weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub weight: u32,
}

impl Target {
    pub fn new(host: impl Into<String>, weight: u32) -> Self {
        Self {
            host: host.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalancerError {
    #[error("no targets to elect from")]
    EmptyTargetList,
    #[error("invalid targets, all weights are zero")]
    ZeroWeight,
}

/// Strategy electing one target from a candidate list. Implementations are
/// internally synchronized and shared across request workers.
pub trait Balancer: Send + Sync + 'static {
    fn elect<'a>(&self, targets: &'a [Target]) -> Result<&'a Target, BalancerError>;
}

/// Fixed single-target fast path: returns the sole target without touching
/// any shared state.
pub struct SingleTarget;

impl Balancer for SingleTarget {
    fn elect<'a>(&self, targets: &'a [Target]) -> Result<&'a Target, BalancerError> {
        targets.first().ok_or(BalancerError::EmptyTargetList)
    }
}

/// Round-robin election over the slice index space.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn elect<'a>(&self, targets: &'a [Target]) -> Result<&'a Target, BalancerError> {
        if targets.is_empty() {
            return Err(BalancerError::EmptyTargetList);
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(&targets[count % targets.len()])
    }
}

/// Weighted election: a uniform draw in `[0, Σweights)` walked linearly over
/// the candidates. O(N), with N expected small.
pub struct Weighted;

impl Balancer for Weighted {
    fn elect<'a>(&self, targets: &'a [Target]) -> Result<&'a Target, BalancerError> {
        if targets.is_empty() {
            return Err(BalancerError::EmptyTargetList);
        }
        if targets.len() == 1 {
            return Ok(&targets[0]);
        }

        let total: u64 = targets.iter().map(|t| u64::from(t.weight)).sum();
        if total == 0 {
            return Err(BalancerError::ZeroWeight);
        }

        let draw = rand::rng().random_range(0..total);
        let mut pos = 0u64;
        for target in targets {
            pos += u64::from(target.weight);
            if draw < pos {
                return Ok(target);
            }
        }
        unreachable!("draw is bounded by the weight sum");
    }
}

/// Create a balancer for a host list, short-circuiting single-target lists.
pub fn for_targets(mode: BalancingMode, targets: &[Target]) -> Box<dyn Balancer> {
    if targets.len() <= 1 {
        return Box::new(SingleTarget);
    }
    match mode {
        BalancingMode::RoundRobin => Box::new(RoundRobin::new()),
        BalancingMode::Weighted => Box::new(Weighted),
    }
}

/// Pair a backend's hosts with weights (index-aligned, defaulting to 1).
pub fn targets_from_hosts(hosts: &[String], weights: &[u32]) -> Vec<Target> {
    hosts
        .iter()
        .enumerate()
        .map(|(i, host)| Target::new(host.clone(), weights.get(i).copied().unwrap_or(1)))
        .collect()
}
