//! Fab and FabArray: dense, fixed-shape numerical tiles distributed over a
//! [`BoxArray`] / [`DistributionMap`] pair.
//!
//! A [`Fab`] is the per-tile dense array: `grown(box, nghost)` cells times
//! `ncomp` components, row-major in the crate's canonical dimension order
//! (fastest-varying index first, components outermost). A [`FabArray`]
//! owns one `Fab` per box this rank's [`DistributionMap`] entry names as
//! local; structural fields (`BoxArray`, `DistributionMap`, `ncomp`,
//! `nghost`) are immutable after construction (spec.md §3).

#![forbid(unsafe_code)]

use crate::boxarray::{BoxArray, BoxId};
use crate::distmap::DistributionMap;
use crate::index::{IndexBox, IntVect};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum FabError {
    #[error("distribution map error: {0}")]
    DistMap(#[from] crate::distmap::DistMapError),
    #[error("box {id} is not owned by rank {rank}")]
    NotLocal { id: BoxId, rank: usize },
    #[error("region {0:?} is not contained in this fab's storage box {1:?}")]
    OutOfBounds(IndexBox, IndexBox),
    #[error("component range [{scomp}, {scomp}+{ncomp}) exceeds fab component count {total}")]
    ComponentRange { scomp: usize, ncomp: usize, total: usize },
}

/// One locally-owned dense numerical tile: `grown(box, nghost)` cells by
/// `ncomp` components, row-major with components as the outermost stride
/// (so a single component's data for a region is contiguous per row).
#[derive(Debug, Clone)]
pub struct Fab {
    storage_box: IndexBox, // = grow(valid_box, nghost)
    valid_box: IndexBox,
    ncomp: usize,
    data: Vec<f64>,
    strides: [i64; crate::index::MAX_DIM],
}

/// Sentinel value used to initialize ghost cells before any fill, so tests
/// can distinguish "never written" from a real zero (spec.md §8 Scenario A:
/// "other ghost cells remain unset (implementation-defined sentinel)").
pub const UNSET_SENTINEL: f64 = f64::NAN;

impl Fab {
    pub fn new(valid_box: IndexBox, nghost: &IntVect, ncomp: usize) -> Self {
        let storage_box = valid_box.grow(nghost);
        let dim = storage_box.dim();
        let size = storage_box.size();
        let mut strides = [0i64; crate::index::MAX_DIM];
        let mut acc = 1i64;
        for d in 0..dim {
            strides[d] = acc;
            acc *= size.get(d).max(0);
        }
        let n_cells = storage_box.num_pts() as usize;
        Fab {
            storage_box,
            valid_box,
            ncomp,
            data: vec![UNSET_SENTINEL; n_cells * ncomp],
            strides,
        }
    }

    #[inline]
    pub fn storage_box(&self) -> IndexBox {
        self.storage_box
    }

    #[inline]
    pub fn valid_box(&self) -> IndexBox {
        self.valid_box
    }

    #[inline]
    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    fn cell_offset(&self, cell: &IntVect) -> i64 {
        let lo = self.storage_box.lo();
        let mut off = 0i64;
        for d in 0..self.storage_box.dim() {
            off += (cell.get(d) - lo.get(d)) * self.strides[d];
        }
        off
    }

    fn n_cells(&self) -> usize {
        self.storage_box.num_pts() as usize
    }

    fn check_region(&self, region: &IndexBox) -> Result<(), FabError> {
        let inter = self.storage_box.intersect(region);
        if inter != *region {
            return Err(FabError::OutOfBounds(*region, self.storage_box));
        }
        Ok(())
    }

    fn check_comp(&self, scomp: usize, ncomp: usize) -> Result<(), FabError> {
        if scomp + ncomp > self.ncomp {
            return Err(FabError::ComponentRange { scomp, ncomp, total: self.ncomp });
        }
        Ok(())
    }

    /// Read the value at `cell`, component `comp`.
    pub fn get(&self, cell: &IntVect, comp: usize) -> f64 {
        debug_assert!(!self.storage_box.intersect(&IndexBox::new(*cell, *cell, self.storage_box.centering()).unwrap()).is_empty());
        let off = self.cell_offset(cell) as usize;
        self.data[comp * self.n_cells() + off]
    }

    /// Write the value at `cell`, component `comp`.
    pub fn set(&mut self, cell: &IntVect, comp: usize, value: f64) {
        let off = self.cell_offset(cell) as usize;
        let n = self.n_cells();
        self.data[comp * n + off] = value;
    }

    /// Byte size that packing `region` over components `[scomp, scomp+ncomp)`
    /// would occupy on the wire (spec.md §4.2b / §6): one `f64` per cell
    /// per component, native representation.
    pub fn n_bytes(&self, region: &IndexBox, ncomp: usize) -> usize {
        region.num_pts() as usize * ncomp * std::mem::size_of::<f64>()
    }

    /// Pack `region` (over components `[scomp, scomp+ncomp)`) into `out`,
    /// appending raw little-endian bytes in canonical dimension order
    /// (fastest-varying first within the region), components outermost —
    /// the wire format spec.md §6 fixes byte-exact across peers.
    pub fn pack_into(&self, region: &IndexBox, scomp: usize, ncomp: usize, out: &mut Vec<u8>) -> Result<(), FabError> {
        self.check_region(region)?;
        self.check_comp(scomp, ncomp)?;
        out.reserve(self.n_bytes(region, ncomp));
        for c in 0..ncomp {
            for_each_cell(region, |cell| {
                let v = self.get(&cell, scomp + c);
                out.extend_from_slice(&v.to_le_bytes());
            });
        }
        Ok(())
    }

    /// Inverse of [`Fab::pack_into`]: read raw bytes from `data` and write
    /// into `region` over components `[dcomp, dcomp+ncomp)`, applying `op`
    /// (COPY overwrites, ADD accumulates — spec.md §4.3).
    pub fn unpack_from(&mut self, region: &IndexBox, dcomp: usize, ncomp: usize, data: &[u8], op: UnpackOp) -> Result<(), FabError> {
        self.check_region(region)?;
        self.check_comp(dcomp, ncomp)?;
        let expected = self.n_bytes(region, ncomp);
        if data.len() != expected {
            return Err(FabError::OutOfBounds(*region, self.storage_box));
        }
        let mut cursor = 0usize;
        for c in 0..ncomp {
            for_each_cell(region, |cell| {
                let bytes: [u8; 8] = data[cursor..cursor + 8].try_into().expect("8-byte f64");
                let v = f64::from_le_bytes(bytes);
                match op {
                    UnpackOp::Copy => self.set(&cell, dcomp + c, v),
                    UnpackOp::Add => {
                        let prev = self.get(&cell, dcomp + c);
                        self.set(&cell, dcomp + c, prev + v);
                    }
                }
                cursor += 8;
            });
        }
        Ok(())
    }

    /// Local tile-to-tile copy: read `sregion` over `[scomp, scomp+ncomp)`
    /// from `self` and write into `dst`'s `dregion` over
    /// `[dcomp, dcomp+ncomp)`. `sregion` and `dregion` must have equal
    /// cardinality (spec.md §3, CopyComTag invariant); cells are matched by
    /// position within the region (i-th cell of `sregion` to i-th of
    /// `dregion`).
    pub fn copy_region_into(
        &self,
        sregion: &IndexBox,
        scomp: usize,
        dst: &mut Fab,
        dregion: &IndexBox,
        dcomp: usize,
        ncomp: usize,
        op: UnpackOp,
    ) -> Result<(), FabError> {
        self.check_region(sregion)?;
        self.check_comp(scomp, ncomp)?;
        dst.check_region(dregion)?;
        dst.check_comp(dcomp, ncomp)?;
        if sregion.size() != dregion.size() {
            return Err(FabError::OutOfBounds(*dregion, *sregion));
        }
        let shift = dregion.lo() - sregion.lo();
        for c in 0..ncomp {
            for_each_cell(sregion, |scell| {
                let dcell = scell + shift;
                let v = self.get(&scell, scomp + c);
                match op {
                    UnpackOp::Copy => dst.set(&dcell, dcomp + c, v),
                    UnpackOp::Add => {
                        let prev = dst.get(&dcell, dcomp + c);
                        dst.set(&dcell, dcomp + c, prev + v);
                    }
                }
            });
        }
        Ok(())
    }

    /// Fill every cell of `region` (all components) with a function of
    /// `(cell, comp)` — used by tests to seed deterministic data.
    pub fn fill_with(&mut self, region: &IndexBox, f: impl Fn(&IntVect, usize) -> f64) {
        for comp in 0..self.ncomp {
            for_each_cell(region, |cell| {
                self.set(&cell, comp, f(&cell, comp));
            });
        }
    }
}

/// Reduction policy applied while unpacking (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackOp {
    Copy,
    Add,
}

/// Iterate every integer cell in `region` in canonical (fastest-first)
/// order, lowest dimension varying fastest.
pub fn for_each_cell(region: &IndexBox, mut f: impl FnMut(IntVect)) {
    if region.is_empty() {
        return;
    }
    let dim = region.dim();
    let lo = region.lo();
    let hi = region.hi();
    let mut cur = [0i64; crate::index::MAX_DIM];
    cur[..dim].copy_from_slice(lo.as_slice());
    loop {
        let cell = IntVect::new(&cur[..dim]).expect("valid dim");
        f(cell);
        let mut d = 0;
        loop {
            cur[d] += 1;
            if cur[d] <= hi.get(d) {
                break;
            }
            cur[d] = lo.get(d);
            d += 1;
            if d == dim {
                return;
            }
        }
    }
}

/// A distributed collection of fixed-shape, multi-component [`Fab`]s:
/// `(BoxArray, DistributionMap, ncomp, nghost)`. Owns a `Fab` for every box
/// this rank's `DistributionMap` entry names as local.
pub struct FabArray {
    pub(crate) ba: BoxArray,
    pub(crate) dm: DistributionMap,
    pub(crate) ncomp: usize,
    pub(crate) nghost: IntVect,
    pub(crate) my_rank: usize,
    local: HashMap<BoxId, Fab>,
}

impl FabArray {
    pub fn new(ba: BoxArray, dm: DistributionMap, ncomp: usize, nghost: IntVect, my_rank: usize) -> Result<Self, FabError> {
        dm.validate(ba.len())?;
        let mut local = HashMap::new();
        for (id, valid_box) in ba.iter() {
            if dm.owner(id) == my_rank {
                local.insert(id, Fab::new(valid_box, &nghost, ncomp));
            }
        }
        Ok(Self { ba, dm, ncomp, nghost, my_rank, local })
    }

    #[inline]
    pub fn box_array(&self) -> &BoxArray {
        &self.ba
    }

    #[inline]
    pub fn distribution_map(&self) -> &DistributionMap {
        &self.dm
    }

    #[inline]
    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    #[inline]
    pub fn nghost(&self) -> IntVect {
        self.nghost
    }

    #[inline]
    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn is_local(&self, id: BoxId) -> bool {
        self.local.contains_key(&id)
    }

    pub fn local_ids(&self) -> Vec<BoxId> {
        let mut ids: Vec<BoxId> = self.local.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: BoxId) -> Result<&Fab, FabError> {
        self.local.get(&id).ok_or(FabError::NotLocal { id, rank: self.my_rank })
    }

    pub fn get_mut(&mut self, id: BoxId) -> Result<&mut Fab, FabError> {
        self.local.get_mut(&id).ok_or(FabError::NotLocal { id, rank: self.my_rank })
    }

    /// Mutable access to every locally owned `(BoxId, &mut Fab)` pair,
    /// processed in parallel across tiles (spec.md §5: "tiles are
    /// processed by a parallel-for over iterator positions").
    pub fn par_iter_mut(&mut self) -> impl rayon::iter::ParallelIterator<Item = (&BoxId, &mut Fab)> {
        use rayon::iter::IntoParallelRefMutIterator;
        self.local.par_iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BoxId, &Fab)> {
        self.local.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Centering;

    fn box2(lo: [i64; 2], hi: [i64; 2]) -> IndexBox {
        IndexBox::new(IntVect::new(&lo).unwrap(), IntVect::new(&hi).unwrap(), Centering::Cell).unwrap()
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let b = box2([0, 0], [3, 3]);
        let ng = IntVect::new(&[1, 1]).unwrap();
        let mut src = Fab::new(b, &ng, 2);
        src.fill_with(&b, |c, comp| (100 * c.get(0) + c.get(1) + 1000 * comp as i64) as f64);

        let mut dst = Fab::new(b, &ng, 2);
        let region = box2([0, 0], [3, 3]);
        let mut buf = Vec::new();
        src.pack_into(&region, 0, 2, &mut buf).unwrap();
        dst.unpack_from(&region, 0, 2, &buf, UnpackOp::Copy).unwrap();

        for comp in 0..2 {
            assert_eq!(dst.get(&IntVect::new(&[2, 2]).unwrap(), comp), src.get(&IntVect::new(&[2, 2]).unwrap(), comp));
        }
    }

    #[test]
    fn add_op_accumulates() {
        let b = box2([0, 0], [1, 1]);
        let ng = IntVect::new(&[0, 0]).unwrap();
        let mut dst = Fab::new(b, &ng, 1);
        dst.fill_with(&b, |_, _| 1.0);

        let mut buf = Vec::new();
        let src = {
            let mut f = Fab::new(b, &ng, 1);
            f.fill_with(&b, |_, _| 1.0);
            f
        };
        src.pack_into(&b, 0, 1, &mut buf).unwrap();
        dst.unpack_from(&b, 0, 1, &buf, UnpackOp::Add).unwrap();

        assert_eq!(dst.get(&IntVect::new(&[0, 0]).unwrap(), 0), 2.0);
    }

    #[test]
    fn fabarray_owns_only_local_boxes() {
        let ba = BoxArray::new(vec![box2([0, 0], [3, 3]), box2([4, 0], [7, 3])]).unwrap();
        let dm = DistributionMap::new(vec![0, 1]);
        let fa = FabArray::new(ba, dm, 1, IntVect::new(&[1, 1]).unwrap(), 0).unwrap();
        assert_eq!(fa.local_ids(), vec![0]);
        assert!(fa.get(0).is_ok());
        assert!(fa.get(1).is_err());
    }
}
