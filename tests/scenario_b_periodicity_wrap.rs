//! spec.md §8 Scenario B: periodicity wrap.
//!
//! A single tile [0,3]x[0,3] on one rank, periodic on both axes with
//! period 4, nghost=1. After FillBoundary, ghost cell (-1, j) equals
//! valid cell (3, j), (4, j) equals (0, j), and the corner (-1,-1) equals
//! (3, 3).

use haloflux::arena::HostArena;
use haloflux::boxarray::BoxArray;
use haloflux::comm::{SingleRank, Transport};
use haloflux::distmap::DistributionMap;
use haloflux::exchange::fill_boundary;
use haloflux::fab::FabArray;
use haloflux::index::{Centering, IndexBox, IntVect, Periodicity};
use haloflux::plan::build_fb_plan;

fn bx(lo: [i64; 2], hi: [i64; 2]) -> IndexBox {
    IndexBox::new(IntVect::new(&lo).unwrap(), IntVect::new(&hi).unwrap(), Centering::Cell).unwrap()
}

#[test]
fn single_tile_wraps_on_both_axes_including_the_corner() {
    let ba = BoxArray::new(vec![bx([0, 0], [3, 3])]).unwrap();
    let dm = DistributionMap::new(vec![0]);
    let nghost = IntVect::new(&[1, 1]).unwrap();
    let period = Periodicity::new(vec![4, 4]);

    let transport = SingleRank::default();
    let mut fa = FabArray::new(ba.clone(), dm.clone(), 1, nghost, transport.my_proc()).unwrap();
    fa.get_mut(0).unwrap().fill_with(&bx([0, 0], [3, 3]), |c, _| (c.get(0) * 10 + c.get(1)) as f64);

    let arena = HostArena::default();
    let plan = build_fb_plan(&ba, &dm, nghost, &period, false, false, transport.my_proc());
    fill_boundary(&mut fa, &transport, &arena, &plan).unwrap();

    let f = fa.get(0).unwrap();
    for j in 0..=3 {
        assert_eq!(f.get(&IntVect::new(&[-1, j]).unwrap(), 0), f.get(&IntVect::new(&[3, j]).unwrap(), 0));
        assert_eq!(f.get(&IntVect::new(&[4, j]).unwrap(), 0), f.get(&IntVect::new(&[0, j]).unwrap(), 0));
    }
    assert_eq!(f.get(&IntVect::new(&[-1, -1]).unwrap(), 0), f.get(&IntVect::new(&[3, 3]).unwrap(), 0));
}

#[test]
fn calling_fill_boundary_twice_is_idempotent() {
    // spec.md §8 invariant 3: a second call with no intervening mutation
    // leaves the state unchanged.
    let ba = BoxArray::new(vec![bx([0, 0], [3, 3])]).unwrap();
    let dm = DistributionMap::new(vec![0]);
    let nghost = IntVect::new(&[1, 1]).unwrap();
    let period = Periodicity::new(vec![4, 4]);

    let transport = SingleRank::default();
    let mut fa = FabArray::new(ba.clone(), dm.clone(), 1, nghost, transport.my_proc()).unwrap();
    fa.get_mut(0).unwrap().fill_with(&bx([0, 0], [3, 3]), |c, _| (c.get(0) * 10 + c.get(1)) as f64);

    let arena = HostArena::default();
    let plan = build_fb_plan(&ba, &dm, nghost, &period, false, false, transport.my_proc());
    fill_boundary(&mut fa, &transport, &arena, &plan).unwrap();
    let first = fa.get(0).unwrap().get(&IntVect::new(&[-1, -1]).unwrap(), 0);

    fill_boundary(&mut fa, &transport, &arena, &plan).unwrap();
    let second = fa.get(0).unwrap().get(&IntVect::new(&[-1, -1]).unwrap(), 0);

    assert_eq!(first, second);
}
