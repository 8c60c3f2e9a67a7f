//! Index algebra: integer vectors, rectangular index boxes, centering, and
//! periodicity shifts.
//!
//! # What this module provides
//! - [`IntVect`]: a small fixed-dimension integer vector (D ∈ {1,2,3}).
//! - [`IndexBox`]: an inclusive-coordinate rectangular region plus a
//!   [`Centering`] tag, with intersect/grow/refine/coarsen/translate.
//! - [`Periodicity`]: which axes wrap, and the shift vectors that result.
//! - [`Orientation`]: a (direction, side) pair used to key per-face storage.
//!
//! Everything here is a pure value type; no global state, no I/O.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::cmp::{max, min};

/// Spatial dimension supported by this crate. AMR meshes in practice are
/// 1, 2, or 3 dimensional; higher D is not meaningful for a Cartesian mesh.
pub const MAX_DIM: usize = 3;

/// Errors raised by index-algebra constructors and operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("dimension must be in 1..={MAX_DIM} (got {0})")]
    BadDim(usize),
    #[error("direction {dir} out of range for dimension {dim}")]
    BadDirection { dir: usize, dim: usize },
    #[error("ratio must be positive (got {0})")]
    BadRatio(i64),
}

/// An integer vector of the crate's working dimension.
///
/// Stored as a fixed `[i64; MAX_DIM]` with an explicit `dim` so that boxes
/// of different dimensionality can't be silently mixed; unused trailing
/// components are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntVect {
    dim: usize,
    v: [i64; MAX_DIM],
}

impl IntVect {
    /// Construct a vector from `dim` components (`dim` in `1..=MAX_DIM`).
    pub fn new(components: &[i64]) -> Result<Self, IndexError> {
        let dim = components.len();
        if dim == 0 || dim > MAX_DIM {
            return Err(IndexError::BadDim(dim));
        }
        let mut v = [0i64; MAX_DIM];
        v[..dim].copy_from_slice(components);
        Ok(Self { dim, v })
    }

    /// All-zero vector of the given dimension.
    pub fn zero(dim: usize) -> Result<Self, IndexError> {
        Self::new(&vec![0i64; dim])
    }

    /// All-`value` vector of the given dimension (used to build ghost widths
    /// like `IntVect::splat(3, 1)`).
    pub fn splat(dim: usize, value: i64) -> Result<Self, IndexError> {
        Self::new(&vec![value; dim])
    }

    /// Unit vector with `1` in direction `dir`, `0` elsewhere.
    pub fn unit(dim: usize, dir: usize) -> Result<Self, IndexError> {
        if dir >= dim {
            return Err(IndexError::BadDirection { dir, dim });
        }
        let mut c = vec![0i64; dim];
        c[dir] = 1;
        Self::new(&c)
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn get(&self, i: usize) -> i64 {
        debug_assert!(i < self.dim);
        self.v[i]
    }

    #[inline]
    pub fn as_slice(&self) -> &[i64] {
        &self.v[..self.dim]
    }

    #[inline]
    pub fn max_component(&self) -> i64 {
        self.as_slice().iter().copied().max().unwrap_or(0)
    }

    /// True if every component is zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.as_slice().iter().all(|&c| c == 0)
    }

    fn zip_map(&self, other: &Self, f: impl Fn(i64, i64) -> i64) -> Self {
        debug_assert_eq!(self.dim, other.dim, "dimension mismatch");
        let mut v = [0i64; MAX_DIM];
        for i in 0..self.dim {
            v[i] = f(self.v[i], other.v[i]);
        }
        Self { dim: self.dim, v }
    }

    pub fn component_min(&self, other: &Self) -> Self {
        self.zip_map(other, min)
    }

    pub fn component_max(&self, other: &Self) -> Self {
        self.zip_map(other, max)
    }
}

impl std::ops::Add for IntVect {
    type Output = IntVect;
    fn add(self, rhs: IntVect) -> IntVect {
        self.zip_map(&rhs, |a, b| a + b)
    }
}

impl std::ops::Sub for IntVect {
    type Output = IntVect;
    fn sub(self, rhs: IntVect) -> IntVect {
        self.zip_map(&rhs, |a, b| a - b)
    }
}

impl std::ops::Neg for IntVect {
    type Output = IntVect;
    fn neg(self) -> IntVect {
        let mut v = [0i64; MAX_DIM];
        for i in 0..self.dim {
            v[i] = -self.v[i];
        }
        IntVect { dim: self.dim, v }
    }
}

/// What kind of mesh location an [`IndexBox`]'s indices refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Centering {
    /// Cell-centered: index `i` names cell `i`.
    Cell,
    /// Node-centered on every axis: index `i` names the node at the
    /// low corner of cell `i`.
    Node,
    /// Face-centered in direction `dir`: nodal along `dir`, cell-centered
    /// on every other axis.
    Face(usize),
}

/// One face direction/side pair, used to key per-face storage
/// (`fine_map`/`crse_map` in the flux register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Orientation {
    pub dir: usize,
    pub side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Lo,
    Hi,
}

impl Orientation {
    pub fn new(dir: usize, side: Side) -> Self {
        Self { dir, side }
    }

    /// All `2 * dim` orientations in `(dir, side)` order, `Lo` before `Hi`.
    pub fn all(dim: usize) -> Vec<Orientation> {
        let mut out = Vec::with_capacity(2 * dim);
        for dir in 0..dim {
            out.push(Orientation::new(dir, Side::Lo));
            out.push(Orientation::new(dir, Side::Hi));
        }
        out
    }
}

/// An inclusive-coordinate rectangular index region `[lo, hi]` in D
/// dimensions plus a [`Centering`] tag.
///
/// `lo` and `hi` are componentwise inclusive; a box is *empty* when any
/// component has `lo > hi`. Empty boxes are valid values and propagate
/// through intersection (spec.md §3, IndexBox invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    lo: IntVect,
    hi: IntVect,
    centering: Centering,
}

impl IndexBox {
    pub fn new(lo: IntVect, hi: IntVect, centering: Centering) -> Result<Self, IndexError> {
        if lo.dim() != hi.dim() {
            return Err(IndexError::BadDim(hi.dim()));
        }
        if let Centering::Face(dir) = centering {
            if dir >= lo.dim() {
                return Err(IndexError::BadDirection { dir, dim: lo.dim() });
            }
        }
        Ok(Self { lo, hi, centering })
    }

    #[inline]
    pub fn lo(&self) -> IntVect {
        self.lo
    }

    #[inline]
    pub fn hi(&self) -> IntVect {
        self.hi
    }

    #[inline]
    pub fn centering(&self) -> Centering {
        self.centering
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.lo.dim()
    }

    /// An empty box has at least one component with `lo > hi`.
    pub fn is_empty(&self) -> bool {
        (0..self.dim()).any(|i| self.lo.get(i) > self.hi.get(i))
    }

    /// Number of indices along each axis (0 for an empty box on that axis).
    pub fn size(&self) -> IntVect {
        let mut v = [0i64; MAX_DIM];
        for i in 0..self.dim() {
            v[i] = (self.hi.get(i) - self.lo.get(i) + 1).max(0);
        }
        IntVect { dim: self.dim(), v }
    }

    /// Total index count (0 if empty).
    pub fn num_pts(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.size().as_slice().iter().map(|&c| c as u64).product()
    }

    /// Componentwise-inclusive intersection. Returns an empty box (not an
    /// error) when the regions don't overlap, per spec.md's "empty boxes
    /// propagate" invariant.
    pub fn intersect(&self, other: &IndexBox) -> IndexBox {
        let lo = self.lo.component_max(&other.lo);
        let hi = self.hi.component_min(&other.hi);
        IndexBox { lo, hi, centering: self.centering }
    }

    /// Grow by `n` cells on every side of every axis.
    pub fn grow(&self, n: &IntVect) -> IndexBox {
        IndexBox {
            lo: self.lo - *n,
            hi: self.hi + *n,
            centering: self.centering,
        }
    }

    /// Grow by `n` cells on every side of a single axis only.
    pub fn grow_dir(&self, dir: usize, n: i64) -> IndexBox {
        let mut lo = self.lo;
        let mut hi = self.hi;
        let mut lov = [0i64; MAX_DIM];
        let mut hiv = [0i64; MAX_DIM];
        lov[..lo.dim()].copy_from_slice(lo.as_slice());
        hiv[..hi.dim()].copy_from_slice(hi.as_slice());
        lov[dir] -= n;
        hiv[dir] += n;
        lo = IntVect { dim: lo.dim(), v: lov };
        hi = IntVect { dim: hi.dim(), v: hiv };
        IndexBox { lo, hi, centering: self.centering }
    }

    /// Translate by `shift`.
    pub fn translate(&self, shift: &IntVect) -> IndexBox {
        IndexBox {
            lo: self.lo + *shift,
            hi: self.hi + *shift,
            centering: self.centering,
        }
    }

    /// Refine by an integer ratio applied uniformly to every axis.
    pub fn refine(&self, ratio: i64) -> Result<IndexBox, IndexError> {
        if ratio <= 0 {
            return Err(IndexError::BadRatio(ratio));
        }
        let mut lov = [0i64; MAX_DIM];
        let mut hiv = [0i64; MAX_DIM];
        for i in 0..self.dim() {
            lov[i] = self.lo.get(i) * ratio;
            hiv[i] = (self.hi.get(i) + 1) * ratio - 1;
        }
        Ok(IndexBox {
            lo: IntVect { dim: self.dim(), v: lov },
            hi: IntVect { dim: self.dim(), v: hiv },
            centering: self.centering,
        })
    }

    /// Coarsen by an integer ratio applied uniformly to every axis (floor
    /// division on both endpoints, matching cell-index coarsening).
    pub fn coarsen(&self, ratio: i64) -> Result<IndexBox, IndexError> {
        if ratio <= 0 {
            return Err(IndexError::BadRatio(ratio));
        }
        let mut lov = [0i64; MAX_DIM];
        let mut hiv = [0i64; MAX_DIM];
        for i in 0..self.dim() {
            lov[i] = self.lo.get(i).div_euclid(ratio);
            hiv[i] = self.hi.get(i).div_euclid(ratio);
        }
        Ok(IndexBox {
            lo: IntVect { dim: self.dim(), v: lov },
            hi: IntVect { dim: self.dim(), v: hiv },
            centering: self.centering,
        })
    }

    /// Extract the single face of this box on `orientation`, as a
    /// `Centering::Face(dir)` box of thickness 1 along `dir`.
    pub fn face(&self, orientation: Orientation) -> IndexBox {
        let mut lo = self.lo;
        let mut hi = self.hi;
        let mut lov = [0i64; MAX_DIM];
        let mut hiv = [0i64; MAX_DIM];
        lov[..lo.dim()].copy_from_slice(lo.as_slice());
        hiv[..hi.dim()].copy_from_slice(hi.as_slice());
        let plane = match orientation.side {
            Side::Lo => self.lo.get(orientation.dir),
            Side::Hi => self.hi.get(orientation.dir) + 1,
        };
        lov[orientation.dir] = plane;
        hiv[orientation.dir] = plane;
        lo = IntVect { dim: lo.dim(), v: lov };
        hi = IntVect { dim: hi.dim(), v: hiv };
        IndexBox {
            lo,
            hi,
            centering: Centering::Face(orientation.dir),
        }
    }
}

/// Which axes of the domain wrap around, and by how much.
///
/// A wrap on axis `d` means a ghost cell beyond the domain on that axis is
/// filled from the opposite side, shifted by `period[d]` (typically the
/// domain extent along `d`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Periodicity {
    period: Vec<i64>, // 0 means "not periodic on this axis"
}

impl Periodicity {
    /// No periodicity at all, for `dim` axes.
    pub fn non_periodic(dim: usize) -> Self {
        Self { period: vec![0; dim] }
    }

    /// Periodic on every listed axis with the given period length; `0`
    /// disables periodicity on that axis.
    pub fn new(period: Vec<i64>) -> Self {
        Self { period }
    }

    pub fn dim(&self) -> usize {
        self.period.len()
    }

    pub fn is_periodic(&self, dir: usize) -> bool {
        self.period.get(dir).copied().unwrap_or(0) != 0
    }

    pub fn is_any_periodic(&self) -> bool {
        self.period.iter().any(|&p| p != 0)
    }

    /// All shift vectors to try when searching for periodic images,
    /// including the zero shift (the direct, non-wrapped case). Order is
    /// deterministic: zero shift first, then lexicographic over the
    /// per-axis `{-1, 0, 1}` multipliers, skipping non-periodic axes
    /// (always multiplier 0 there).
    pub fn shift_int_vects(&self) -> Vec<IntVect> {
        let dim = self.dim();
        let axes: Vec<usize> = (0..dim).filter(|&d| self.is_periodic(d)).collect();
        let mut out = Vec::new();
        let combos = 3usize.pow(axes.len() as u32);
        for combo in 0..combos {
            let mut mult = vec![0i64; dim];
            let mut c = combo;
            for &ax in &axes {
                let digit = (c % 3) as i64 - 1; // -1, 0, 1
                mult[ax] = digit;
                c /= 3;
            }
            let mut v = vec![0i64; dim];
            for &ax in &axes {
                v[ax] = mult[ax] * self.period[ax];
            }
            let is_zero = v.iter().all(|&x| x == 0);
            let iv = IntVect::new(&v).expect("periodicity dim matches");
            if is_zero {
                out.insert(0, iv);
            } else {
                out.push(iv);
            }
        }
        if out.is_empty() {
            out.push(IntVect::zero(dim).expect("valid dim"));
        }
        out
    }
}
