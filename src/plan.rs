//! Cached communication plans: the `CopyComTag` lists that describe, once
//! and for all for a given `(BoxArray, DistributionMap, nghost, periodicity,
//! variant)` combination, exactly which cell regions move between which
//! tiles (spec.md §3, §4.1).
//!
//! Two flavors share one binning algorithm: `FbPlan` (fill-boundary, a
//! `BoxArray` exchanging with itself) and `CpcPlan` (parallel-copy, between
//! a destination and a possibly differently-laid-out source). Both are
//! built by [`build_plan`] and kept in a small process-local LRU so that
//! repeated `FillBoundary`/`ParallelCopy` calls on the same layout don't
//! repeat the intersection search (spec.md §3's plan-cache invariant).

#![forbid(unsafe_code)]

use crate::boxarray::{BoxArray, BoxId};
use crate::distmap::DistributionMap;
use crate::index::{IndexBox, IntVect, Periodicity};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("destination and source box arrays have mismatched dimension")]
    DimMismatch,
}

/// One region transfer: `ncomp` components of `sbox` in tile `src_index`
/// land at `dbox` in tile `dst_index`. `sbox` and `dbox` have equal shape
/// (one may be a periodic translate of the other) so a straight cell-by-cell
/// copy never needs to know about periodicity once the tag exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyComTag {
    pub src_index: BoxId,
    pub dst_index: BoxId,
    pub sbox: IndexBox,
    pub dbox: IndexBox,
}

/// A plan's tags, binned by who must do what from the executing rank's
/// point of view (spec.md §4.1's Loc/Snd/Rcv binning).
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    /// Same-rank transfers: plain copies, no communication.
    pub loc: Vec<CopyComTag>,
    /// Sends this rank owes, grouped by destination rank.
    pub snd: HashMap<usize, Vec<CopyComTag>>,
    /// Receives this rank is owed, grouped by source rank.
    pub rcv: HashMap<usize, Vec<CopyComTag>>,
    /// True when every rank's incoming tags land in disjoint destination
    /// regions, so unpacking can run in parallel across peers without a
    /// lock (spec.md §3's `threadsafe_rcv` invariant).
    pub threadsafe_rcv: bool,
}

impl TagSet {
    fn push(&mut self, tag: CopyComTag, my_rank: usize, src_owner: usize, dst_owner: usize) {
        if src_owner == dst_owner {
            if src_owner == my_rank {
                self.loc.push(tag);
            }
            // Neither end is local: irrelevant to this rank's plan.
        } else if src_owner == my_rank {
            self.snd.entry(dst_owner).or_default().push(tag);
        } else if dst_owner == my_rank {
            self.rcv.entry(src_owner).or_default().push(tag);
        }
    }

    fn finish(&mut self) {
        self.threadsafe_rcv = rcv_regions_are_disjoint(&self.rcv);
    }
}

fn rcv_regions_are_disjoint(rcv: &HashMap<usize, Vec<CopyComTag>>) -> bool {
    let mut all: Vec<&CopyComTag> = rcv.values().flatten().collect();
    all.sort_by_key(|t| (t.dst_index, t.dbox.lo().as_slice().to_vec()));
    for pair in all.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.dst_index == b.dst_index && !a.dbox.intersect(&b.dbox).is_empty() {
            return false;
        }
    }
    true
}

/// A fill-boundary plan: ghost cells of `ba` filled from other tiles of the
/// same `ba` (direct abutment and, if `period` wraps, periodic images).
pub type FbPlan = TagSet;

/// A parallel-copy plan: the whole `grow(dst_box, dnghost)` region of each
/// destination tile filled from `grow(src_box, snghost)` of a (possibly
/// unrelated) source layout.
pub type CpcPlan = TagSet;

/// Decompose `a \ b` into disjoint boxes (assumes `b` intersects `a`'s
/// interior; if it doesn't, returns `a` itself). Classic per-axis "notch"
/// decomposition: trim a slab off each side of the dimension in turn, so
/// the final center pushed out from `a` is exactly `a.intersect(b)`.
fn box_difference(a: &IndexBox, b: &IndexBox) -> Vec<IndexBox> {
    let bi = a.intersect(b);
    if bi.is_empty() {
        return vec![*a];
    }
    let mut pieces = Vec::new();
    let mut remaining = *a;
    for d in 0..a.dim() {
        if remaining.lo().get(d) < bi.lo().get(d) {
            let mut hiv = remaining.hi().as_slice().to_vec();
            hiv[d] = bi.lo().get(d) - 1;
            let hi = IntVect::new(&hiv).expect("dim preserved");
            pieces.push(IndexBox::new(remaining.lo(), hi, a.centering()).expect("dims match"));

            let mut lov = remaining.lo().as_slice().to_vec();
            lov[d] = bi.lo().get(d);
            let lo = IntVect::new(&lov).expect("dim preserved");
            remaining = IndexBox::new(lo, remaining.hi(), a.centering()).expect("dims match");
        }
        if remaining.hi().get(d) > bi.hi().get(d) {
            let mut lov = remaining.lo().as_slice().to_vec();
            lov[d] = bi.hi().get(d) + 1;
            let lo = IntVect::new(&lov).expect("dim preserved");
            pieces.push(IndexBox::new(lo, remaining.hi(), a.centering()).expect("dims match"));

            let mut hiv = remaining.hi().as_slice().to_vec();
            hiv[d] = bi.hi().get(d);
            let hi = IntVect::new(&hiv).expect("dim preserved");
            remaining = IndexBox::new(remaining.lo(), hi, a.centering()).expect("dims match");
        }
    }
    pieces
}

/// The region(s) of `grow(valid, nghost)` that are *not* `valid` —
/// the fill-boundary destination set for one tile.
///
/// `cross` stencils never touch diagonal corners: rather than growing on
/// every axis at once and subtracting the corners back out, each axis is
/// grown and subtracted on its own and the per-axis arms are unioned, which
/// never produces a corner piece in the first place (spec.md §4.1).
fn ghost_shell(valid: &IndexBox, nghost: &IntVect, cross: bool) -> Vec<IndexBox> {
    if cross {
        let mut arms = Vec::new();
        for d in 0..valid.dim() {
            let n = nghost.get(d);
            if n == 0 {
                continue;
            }
            let grown = valid.grow_dir(d, n);
            arms.extend(box_difference(&grown, valid));
        }
        arms
    } else {
        let grown = valid.grow(nghost);
        box_difference(&grown, valid)
    }
}

/// Shared core of FB and CPC construction: for every destination tile's
/// target region(s), walk periodic shifts (zero first) querying `source`
/// for overlaps, consuming matched sub-regions out of what remains before
/// trying the next shift so a direct abutment always wins over a periodic
/// image touching the same cells (spec.md §4.1, "sees only the direct one").
fn bin_regions(
    dst_pieces: impl Iterator<Item = (BoxId, IndexBox)>,
    source: &BoxArray,
    period: &Periodicity,
    periodicity_only: bool,
    dm_dst: &DistributionMap,
    dm_src: &DistributionMap,
    my_rank: usize,
) -> TagSet {
    let shifts = period.shift_int_vects();
    let mut tags = TagSet::default();

    for (dst_id, piece0) in dst_pieces {
        let mut remaining = vec![piece0];
        for s in &shifts {
            if periodicity_only && s.is_zero() {
                continue;
            }
            let mut next_remaining = Vec::new();
            for r in remaining {
                if r.is_empty() {
                    continue;
                }
                let shifted = r.translate(s);
                let hits = source.intersections(&shifted);
                if hits.is_empty() {
                    next_remaining.push(r);
                    continue;
                }
                let mut leftover = vec![r];
                for (src_id, ov) in &hits {
                    let dbox = ov.translate(&(-*s));
                    tags.push(
                        CopyComTag { src_index: *src_id, dst_index: dst_id, sbox: *ov, dbox },
                        my_rank,
                        dm_src.owner(*src_id),
                        dm_dst.owner(dst_id),
                    );
                    let mut next_leftover = Vec::new();
                    for lp in leftover {
                        if lp.intersect(&dbox).is_empty() {
                            next_leftover.push(lp);
                        } else {
                            next_leftover.extend(box_difference(&lp, &dbox));
                        }
                    }
                    leftover = next_leftover;
                }
                next_remaining.extend(leftover);
            }
            remaining = next_remaining;
        }
    }

    tags.finish();
    tags
}

/// Build a fill-boundary plan for `ba`/`dm` as seen by `my_rank`.
pub fn build_fb_plan(
    ba: &BoxArray,
    dm: &DistributionMap,
    nghost: IntVect,
    period: &Periodicity,
    cross: bool,
    periodicity_only: bool,
    my_rank: usize,
) -> FbPlan {
    let dst_pieces = ba.iter().flat_map(move |(id, valid)| {
        ghost_shell(&valid, &nghost, cross).into_iter().map(move |p| (id, p))
    });
    bin_regions(dst_pieces, ba, period, periodicity_only, dm, dm, my_rank)
}

/// Build a parallel-copy plan moving `grow(dst_box, dnghost)` of `dst_ba`
/// from `grow(src_box, snghost)` of `src_ba` (spec.md §4.3). Unlike
/// fill-boundary, the whole grown destination tile is the target, not just
/// its ghost annulus: `ParallelCopy` is also how a destination's valid
/// region gets populated from a differently-laid-out source.
pub fn build_cpc_plan(
    dst_ba: &BoxArray,
    dst_dm: &DistributionMap,
    dnghost: IntVect,
    src_ba: &BoxArray,
    src_dm: &DistributionMap,
    snghost: IntVect,
    period: &Periodicity,
    my_rank: usize,
) -> Result<CpcPlan, PlanError> {
    if dst_ba.is_empty() || src_ba.is_empty() {
        return Err(PlanError::DimMismatch);
    }
    if dst_ba.get(0).dim() != src_ba.get(0).dim() || dst_ba.get(0).dim() != period.dim() {
        return Err(PlanError::DimMismatch);
    }
    let src_grown = src_ba.grown(&snghost);
    let dst_pieces = dst_ba.iter().map(move |(id, valid)| (id, valid.grow(&dnghost)));
    Ok(bin_regions(dst_pieces, &src_grown, period, false, dst_dm, src_dm, my_rank))
}

/// Structural key identifying a cached [`FbPlan`]. Cloning the full
/// `BoxArray`/`DistributionMap` into the key is simpler than threading a
/// content-hash/version-counter scheme through every layout mutation, at
/// the cost of an `O(n_boxes)` clone per cache probe; a layout's boxes
/// rarely change within a run, so the cache still saves the intersection
/// search that dominates plan construction (see DESIGN.md).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FbKey {
    pub ba: BoxArray,
    pub dm: DistributionMap,
    pub nghost: IntVect,
    pub period: Periodicity,
    pub cross: bool,
    pub periodicity_only: bool,
    pub my_rank: usize,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CpcKey {
    pub dst_ba: BoxArray,
    pub dst_dm: DistributionMap,
    pub dnghost: IntVect,
    pub src_ba: BoxArray,
    pub src_dm: DistributionMap,
    pub snghost: IntVect,
    pub period: Periodicity,
    pub my_rank: usize,
}

/// Bounded least-recently-used cache. Insertion order doubles as recency
/// order: a hit moves its key to the back, and eviction drops the front.
pub struct PlanCache<K, V> {
    capacity: usize,
    order: Vec<K>,
    entries: HashMap<K, V>,
}

impl<K: Clone + Eq + std::hash::Hash, V: Clone> PlanCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "plan cache capacity must be positive");
        Self { capacity, order: Vec::new(), entries: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached value for `key`, computing and inserting it via
    /// `build` on a miss.
    pub fn get_or_build(&mut self, key: K, build: impl FnOnce() -> V) -> V {
        if let Some(v) = self.entries.get(&key).cloned() {
            self.touch(&key);
            return v;
        }
        tracing::debug!(cache_len = self.entries.len(), capacity = self.capacity, "plan cache miss, building");
        let v = build();
        self.insert(key, v.clone());
        v
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let evict = self.order.remove(0);
            self.entries.remove(&evict);
        }
        self.order.push(key.clone());
        self.entries.insert(key, value);
    }
}
