//! spec.md §8 Scenario A: two tiles, one ghost layer, non-periodic.
//!
//! BA = {[0,0]x[3,3], [4,0]x[7,3]}, DM = {0, 1}, nghost = 1. Cell (i, j)
//! starts at 100*i + j. After FillBoundary, tile 0's right ghost column
//! (i=4) equals tile 1's valid column at i=4, and tile 1's left ghost
//! column (i=3) equals tile 0's valid column at i=3.

use haloflux::boxarray::BoxArray;
use haloflux::channel::ChannelTransport;
use haloflux::comm::Transport;
use haloflux::distmap::DistributionMap;
use haloflux::fab::FabArray;
use haloflux::index::{Centering, IndexBox, IntVect, Periodicity};
use haloflux::plan::build_fb_plan;
use haloflux::{arena::HostArena, exchange::fill_boundary};

fn bx(lo: [i64; 2], hi: [i64; 2]) -> IndexBox {
    IndexBox::new(IntVect::new(&lo).unwrap(), IntVect::new(&hi).unwrap(), Centering::Cell).unwrap()
}

#[test]
fn two_tiles_fill_each_others_abutting_ghost_column() {
    let ba = BoxArray::new(vec![bx([0, 0], [3, 3]), bx([4, 0], [7, 3])]).unwrap();
    let dm = DistributionMap::new(vec![0, 1]);
    let nghost = IntVect::new(&[1, 1]).unwrap();
    let period = Periodicity::non_periodic(2);

    let mut transports = ChannelTransport::job(2);
    let t1 = transports.pop().unwrap();
    let t0 = transports.pop().unwrap();

    let (ba0, dm0, ba1, dm1) = (ba.clone(), dm.clone(), ba.clone(), dm.clone());
    let (period0, period1) = (period.clone(), period.clone());

    let h1 = std::thread::spawn(move || {
        let mut fa = FabArray::new(ba1.clone(), dm1.clone(), 1, nghost, t1.my_proc()).unwrap();
        fa.get_mut(1).unwrap().fill_with(&bx([4, 0], [7, 3]), |c, _| (100 * c.get(0) + c.get(1)) as f64);
        let arena = HostArena::default();
        let plan = build_fb_plan(&ba1, &dm1, nghost, &period1, false, false, t1.my_proc());
        fill_boundary(&mut fa, &t1, &arena, &plan).unwrap();
        let f = fa.get(1).unwrap();
        (0..=3).map(|j| f.get(&IntVect::new(&[3, j]).unwrap(), 0)).collect::<Vec<_>>()
    });

    let mut fa0 = FabArray::new(ba0.clone(), dm0.clone(), 1, nghost, t0.my_proc()).unwrap();
    fa0.get_mut(0).unwrap().fill_with(&bx([0, 0], [3, 3]), |c, _| (100 * c.get(0) + c.get(1)) as f64);
    let arena0 = HostArena::default();
    let plan0 = build_fb_plan(&ba0, &dm0, nghost, &period0, false, false, t0.my_proc());
    fill_boundary(&mut fa0, &t0, &arena0, &plan0).unwrap();

    let f0 = fa0.get(0).unwrap();
    for j in 0..=3 {
        // Tile 0's right ghost column (i=4) mirrors tile 1's valid column at i=4.
        assert_eq!(f0.get(&IntVect::new(&[4, j]).unwrap(), 0), (400 + j) as f64);
    }

    let left_ghost_of_tile1 = h1.join().unwrap();
    for j in 0..=3 {
        // Tile 1's left ghost column (i=3) mirrors tile 0's valid column at i=3.
        assert_eq!(left_ghost_of_tile1[j as usize], (300 + j) as f64);
    }
}
