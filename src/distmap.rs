//! DistributionMap: a total, deterministic function from `BoxId` to owning
//! rank (spec.md §3). All ranks must share an identical copy; this type
//! makes that easy by being plain data (`Vec<usize>`), trivially
//! `serde`-shareable via broadcast.

#![forbid(unsafe_code)]

use crate::boxarray::BoxId;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DistMapError {
    #[error("distribution map has {got} entries, expected {expected} (one per box)")]
    WrongLen { expected: usize, got: usize },
}

/// Maps each box index to the rank that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistributionMap {
    owner: Vec<usize>,
}

impl DistributionMap {
    /// Construct directly from a per-box rank list.
    pub fn new(owner: Vec<usize>) -> Self {
        Self { owner }
    }

    /// Check this map has exactly one entry per box in `n_boxes`.
    pub fn validate(&self, n_boxes: usize) -> Result<(), DistMapError> {
        if self.owner.len() != n_boxes {
            return Err(DistMapError::WrongLen { expected: n_boxes, got: self.owner.len() });
        }
        Ok(())
    }

    /// Round-robin assignment over `n_boxes` boxes across `n_ranks` ranks —
    /// the simplest deterministic map, used by tests and as a default for
    /// callers without a load-balancer (dynamic load balancing is
    /// explicitly out of scope, spec.md §1).
    pub fn round_robin(n_boxes: usize, n_ranks: usize) -> Self {
        assert!(n_ranks > 0, "n_ranks must be positive");
        Self { owner: (0..n_boxes).map(|i| i % n_ranks).collect() }
    }

    /// Seeded-random assignment over `n_boxes` boxes across `n_ranks` ranks.
    /// Every rank must build this from the same `seed` (broadcast it, don't
    /// regenerate it locally) for the map to stay identical across ranks as
    /// spec.md §3 requires — `StdRng::seed_from_u64` makes that a plain
    /// value to share rather than a process to coordinate.
    pub fn random(n_boxes: usize, n_ranks: usize, seed: u64) -> Self {
        assert!(n_ranks > 0, "n_ranks must be positive");
        let mut rng = StdRng::seed_from_u64(seed);
        Self { owner: (0..n_boxes).map(|_| rng.gen_range(0..n_ranks)).collect() }
    }

    #[inline]
    pub fn owner(&self, id: BoxId) -> usize {
        self.owner[id]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.owner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owner.is_empty()
    }

    /// All box ids owned by `rank`, in ascending order.
    pub fn local_ids(&self, rank: usize) -> Vec<BoxId> {
        self.owner
            .iter()
            .enumerate()
            .filter_map(|(id, &r)| (r == rank).then_some(id))
            .collect()
    }

    pub fn max_rank(&self) -> usize {
        self.owner.iter().copied().max().unwrap_or(0)
    }
}
