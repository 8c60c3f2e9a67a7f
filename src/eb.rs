//! Embedded-boundary-aware reductions: classifying which cells a cut
//! geometry covers, and folding that into the volume-fraction field, the
//! "what value does a covered cell hold" convention, and conservative
//! averaging from fine to coarse (spec.md §4.5).
//!
//! Grounded on `AMReX_EBMultiFabUtil.cpp`'s dispatch: regular and covered
//! cells average trivially, single-valued cut cells average with a
//! volume-fraction weight, and a multi-valued cell (more than one disjoint
//! fluid region inside one mesh cell) is refused outright — this crate
//! doesn't carry the sub-cell geometry a correct multi-valued average would
//! need.

#![forbid(unsafe_code)]

use crate::boxarray::BoxId;
use crate::comm::Transport;
use crate::fab::{for_each_cell, FabArray, FabError};
use crate::index::{IndexBox, IntVect};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum EbError {
    #[error("multi-valued cell at {0:?}: average_down needs single-valued sub-cell geometry")]
    MultiValuedCell(IntVect),
    #[error("no EB flags registered for box {0}")]
    MissingFlags(BoxId),
    #[error(transparent)]
    Fab(#[from] FabError),
}

/// Per-cell embedded-boundary classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Entirely inside the flow domain.
    Regular,
    /// Entirely inside the solid body; carries no physical state.
    Covered,
    /// Cut by the boundary into exactly one flow fragment.
    SingleValuedCut,
    /// Cut into more than one disjoint flow fragment — this crate can
    /// classify it but cannot average it (spec.md §4.5 Non-goal).
    MultiValued,
}

/// One tile's EB classification, one [`CellType`] per cell of `region`
/// (no components — geometry is the same for every field).
#[derive(Debug, Clone)]
pub struct EbFlags {
    region: IndexBox,
    flags: Vec<CellType>,
}

impl EbFlags {
    /// Every cell of `region` classified `Regular` (the common case away
    /// from any boundary).
    pub fn new_regular(region: IndexBox) -> Self {
        Self { region, flags: vec![CellType::Regular; region.num_pts() as usize] }
    }

    fn offset(&self, cell: &IntVect) -> usize {
        let lo = self.region.lo();
        let size = self.region.size();
        let mut off = 0i64;
        let mut stride = 1i64;
        for d in 0..self.region.dim() {
            off += (cell.get(d) - lo.get(d)) * stride;
            stride *= size.get(d).max(1);
        }
        off as usize
    }

    pub fn get(&self, cell: &IntVect) -> CellType {
        self.flags[self.offset(cell)]
    }

    pub fn set(&mut self, cell: &IntVect, t: CellType) {
        let off = self.offset(cell);
        self.flags[off] = t;
    }
}

/// Overwrite every covered cell of `fa` with the global minimum value its
/// non-covered cells hold, per component, across every rank (spec.md
/// §4.5: "set_covered"). This gives covered cells a value that can never
/// win a naive `min`-type reduction done elsewhere without EB awareness.
pub fn set_covered(fa: &mut FabArray, flags: &HashMap<BoxId, EbFlags>, transport: &dyn Transport) -> Result<(), EbError> {
    let ncomp = fa.ncomp();
    let mut local_min = vec![f64::INFINITY; ncomp];
    for id in fa.local_ids() {
        let fl = flags.get(&id).ok_or(EbError::MissingFlags(id))?;
        let fab = fa.get(id)?;
        let region = fab.valid_box();
        for_each_cell(&region, |c| {
            if fl.get(&c) == CellType::Covered {
                return;
            }
            for comp in 0..ncomp {
                local_min[comp] = local_min[comp].min(fab.get(&c, comp));
            }
        });
    }

    let global_min = transport.reduce_real_min(local_min);

    for id in fa.local_ids() {
        let fl = flags.get(&id).ok_or(EbError::MissingFlags(id))?;
        let fab = fa.get_mut(id)?;
        let region = fab.valid_box();
        for_each_cell(&region, |c| {
            if fl.get(&c) != CellType::Covered {
                return;
            }
            for comp in 0..ncomp {
                fab.set(&c, comp, global_min[comp]);
            }
        });
    }
    Ok(())
}

/// Set `vfrac` (a single-component field) to the canonical volume fraction
/// implied by `flags`: `1.0` for regular cells, `0.0` for covered cells.
/// Cut-cell values come from the geometry generator and are left alone.
pub fn set_volume_fraction(vfrac: &mut FabArray, flags: &HashMap<BoxId, EbFlags>) -> Result<(), EbError> {
    for id in vfrac.local_ids() {
        let fl = flags.get(&id).ok_or(EbError::MissingFlags(id))?;
        let fab = vfrac.get_mut(id)?;
        let region = fab.valid_box();
        for_each_cell(&region, |c| match fl.get(&c) {
            CellType::Regular => fab.set(&c, 0, 1.0),
            CellType::Covered => fab.set(&c, 0, 0.0),
            CellType::SingleValuedCut | CellType::MultiValued => {}
        });
    }
    Ok(())
}

/// Conservative volume-weighted average of `fine` down to `crse` by
/// `ratio`, deriving each coarse cell's [`CellType`] from the
/// `ratio^dim` fine cells underneath it. `fine`/`crse` and their flag maps
/// are parallel arrays, box `i` of one corresponding to box `i` of the
/// other (the same convention [`crate::fluxreg::FluxRegister`] uses).
///
/// A coarse cell whose fine cells include any [`CellType::MultiValued`]
/// cannot be averaged by this routine and is reported as an error rather
/// than silently producing a wrong conservative value.
pub fn average_down(
    fine: &FabArray,
    fine_vfrac: &FabArray,
    fine_flags: &HashMap<BoxId, EbFlags>,
    crse: &mut FabArray,
    crse_flags: &mut HashMap<BoxId, EbFlags>,
    ratio: i64,
) -> Result<(), EbError> {
    let ncomp = fine.ncomp();
    for crse_id in crse.local_ids() {
        let crse_box = crse.get(crse_id)?.valid_box();
        let centering = crse_box.centering();
        let fine_id = crse_id;
        let ffab = fine.get(fine_id)?;
        let fvfrac = fine_vfrac.get(fine_id)?;
        let fflags = fine_flags.get(&fine_id).ok_or(EbError::MissingFlags(fine_id))?;

        let mut new_flags = EbFlags::new_regular(crse_box);
        let mut err = None;

        {
            let cfab = crse.get_mut(crse_id)?;
            for_each_cell(&crse_box, |ccell| {
                if err.is_some() {
                    return;
                }
                let single = IndexBox::new(ccell, ccell, centering).expect("dims match").refine(ratio).expect("positive ratio");

                let mut any_regular = false;
                let mut any_covered = false;
                let mut any_multi = false;
                let mut vfrac_sum = 0.0f64;
                let mut weighted = vec![0.0f64; ncomp];

                for_each_cell(&single, |fc| {
                    match fflags.get(&fc) {
                        CellType::Regular => any_regular = true,
                        CellType::Covered => any_covered = true,
                        CellType::SingleValuedCut => {}
                        CellType::MultiValued => any_multi = true,
                    }
                    if fflags.get(&fc) != CellType::Covered {
                        let vf = fvfrac.get(&fc, 0);
                        vfrac_sum += vf;
                        for comp in 0..ncomp {
                            weighted[comp] += vf * ffab.get(&fc, comp);
                        }
                    }
                });

                if any_multi {
                    tracing::error!(cell = ?ccell, "multi-valued EB cell has no supported average-down path");
                    err = Some(EbError::MultiValuedCell(ccell));
                    return;
                }

                let kind = if any_regular && !any_covered {
                    CellType::Regular
                } else if any_covered && !any_regular && vfrac_sum == 0.0 {
                    CellType::Covered
                } else {
                    CellType::SingleValuedCut
                };
                new_flags.set(&ccell, kind);

                if vfrac_sum > 0.0 {
                    for comp in 0..ncomp {
                        cfab.set(&ccell, comp, weighted[comp] / vfrac_sum);
                    }
                } else {
                    for comp in 0..ncomp {
                        cfab.set(&ccell, comp, 0.0);
                    }
                }
            });
        }

        if let Some(e) = err {
            return Err(e);
        }
        crse_flags.insert(crse_id, new_flags);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxarray::BoxArray;
    use crate::comm::SingleRank;
    use crate::distmap::DistributionMap;
    use crate::index::Centering;

    fn bx(lo: [i64; 2], hi: [i64; 2]) -> IndexBox {
        IndexBox::new(IntVect::new(&lo).unwrap(), IntVect::new(&hi).unwrap(), Centering::Cell).unwrap()
    }

    #[test]
    fn set_covered_uses_global_min_of_uncovered_cells() {
        let ba = BoxArray::new(vec![bx([0, 0], [1, 1])]).unwrap();
        let dm = DistributionMap::new(vec![0]);
        let zero = IntVect::new(&[0, 0]).unwrap();
        let mut fa = FabArray::new(ba.clone(), dm, 1, zero, 0).unwrap();
        fa.get_mut(0).unwrap().fill_with(&bx([0, 0], [1, 1]), |c, _| (c.get(0) + 10 * c.get(1)) as f64);

        let mut flags = HashMap::new();
        let mut fl = EbFlags::new_regular(bx([0, 0], [1, 1]));
        fl.set(&IntVect::new(&[1, 1]).unwrap(), CellType::Covered);
        flags.insert(0, fl);

        let transport = SingleRank::default();
        set_covered(&mut fa, &flags, &transport).unwrap();

        // Uncovered values are 0, 1, 10; global min is 0.
        assert_eq!(fa.get(0).unwrap().get(&IntVect::new(&[1, 1]).unwrap(), 0), 0.0);
        assert_eq!(fa.get(0).unwrap().get(&IntVect::new(&[0, 0]).unwrap(), 0), 0.0);
    }

    #[test]
    fn volume_fraction_matches_regular_and_covered_flags() {
        let ba = BoxArray::new(vec![bx([0, 0], [1, 0])]).unwrap();
        let dm = DistributionMap::new(vec![0]);
        let zero = IntVect::new(&[0, 0]).unwrap();
        let mut vfrac = FabArray::new(ba, dm, 1, zero, 0).unwrap();

        let mut flags = HashMap::new();
        let mut fl = EbFlags::new_regular(bx([0, 0], [1, 0]));
        fl.set(&IntVect::new(&[1, 0]).unwrap(), CellType::Covered);
        flags.insert(0, fl);

        set_volume_fraction(&mut vfrac, &flags).unwrap();
        assert_eq!(vfrac.get(0).unwrap().get(&IntVect::new(&[0, 0]).unwrap(), 0), 1.0);
        assert_eq!(vfrac.get(0).unwrap().get(&IntVect::new(&[1, 0]).unwrap(), 0), 0.0);
    }

    #[test]
    fn average_down_volume_weights_cut_cells() {
        let fine_ba = BoxArray::new(vec![bx([0, 0], [1, 1])]).unwrap();
        let crse_ba = BoxArray::new(vec![bx([0, 0], [0, 0])]).unwrap();
        let dm = DistributionMap::new(vec![0]);
        let zero = IntVect::new(&[0, 0]).unwrap();

        let mut fine = FabArray::new(fine_ba.clone(), dm.clone(), 1, zero, 0).unwrap();
        fine.get_mut(0).unwrap().fill_with(&bx([0, 0], [1, 1]), |_, _| 2.0);
        let mut fine_vfrac = FabArray::new(fine_ba.clone(), dm.clone(), 1, zero, 0).unwrap();

        let mut fine_flags = HashMap::new();
        let mut fl = EbFlags::new_regular(bx([0, 0], [1, 1]));
        fl.set(&IntVect::new(&[1, 1]).unwrap(), CellType::Covered);
        fine_flags.insert(0, fl);

        fine_vfrac.get_mut(0).unwrap().fill_with(&bx([0, 0], [1, 1]), |c, _| {
            if c.as_slice() == [1, 1] {
                0.0
            } else {
                1.0
            }
        });

        let mut crse = FabArray::new(crse_ba.clone(), dm.clone(), 1, zero, 0).unwrap();
        let mut crse_flags = HashMap::new();

        average_down(&fine, &fine_vfrac, &fine_flags, &mut crse, &mut crse_flags, 2).unwrap();

        // Three regular fine cells at value 2.0, one covered (weight 0):
        // volume-weighted average is still 2.0.
        assert_eq!(crse.get(0).unwrap().get(&IntVect::new(&[0, 0]).unwrap(), 0), 2.0);
        assert_eq!(crse_flags.get(&0).unwrap().get(&IntVect::new(&[0, 0]).unwrap()), CellType::SingleValuedCut);
    }

    #[test]
    fn average_down_rejects_multi_valued_cells() {
        let fine_ba = BoxArray::new(vec![bx([0, 0], [1, 1])]).unwrap();
        let crse_ba = BoxArray::new(vec![bx([0, 0], [0, 0])]).unwrap();
        let dm = DistributionMap::new(vec![0]);
        let zero = IntVect::new(&[0, 0]).unwrap();

        let fine = FabArray::new(fine_ba.clone(), dm.clone(), 1, zero, 0).unwrap();
        let fine_vfrac = FabArray::new(fine_ba.clone(), dm.clone(), 1, zero, 0).unwrap();
        let mut fine_flags = HashMap::new();
        let mut fl = EbFlags::new_regular(bx([0, 0], [1, 1]));
        fl.set(&IntVect::new(&[0, 0]).unwrap(), CellType::MultiValued);
        fine_flags.insert(0, fl);

        let mut crse = FabArray::new(crse_ba, dm, 1, zero, 0).unwrap();
        let mut crse_flags = HashMap::new();
        let result = average_down(&fine, &fine_vfrac, &fine_flags, &mut crse, &mut crse_flags, 2);
        assert!(matches!(result, Err(EbError::MultiValuedCell(_))));
    }
}
