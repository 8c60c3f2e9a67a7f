//! spec.md §8 Scenario D: refluxing in 2D.
//!
//! coarse BA = {[0,0]x[1,1]}, fine BA = {[0,0]x[3,3]} (covering the coarse
//! box at ratio 2), ratio=2. Fine x-low flux at (i=0, j in [0,3]) is
//! f(j) = j. After `store(dir=0, scale=1)` and `communicate`, the coarse
//! x-low face at (i=0, j in [0,1]) equals (f(2j)+f(2j+1))/2 = 2j + 0.5.

use haloflux::boxarray::BoxArray;
use haloflux::comm::SingleRank;
use haloflux::distmap::DistributionMap;
use haloflux::fluxreg::FluxRegister;
use haloflux::index::{Centering, IndexBox, IntVect, Orientation, Side};

fn bx(lo: [i64; 2], hi: [i64; 2]) -> IndexBox {
    IndexBox::new(IntVect::new(&lo).unwrap(), IntVect::new(&hi).unwrap(), Centering::Cell).unwrap()
}

#[test]
fn coarse_face_equals_arithmetic_mean_of_two_fine_faces() {
    let fine_ba = BoxArray::new(vec![bx([0, 0], [3, 3])]).unwrap();
    let crse_ba = BoxArray::new(vec![bx([0, 0], [1, 1])]).unwrap();
    let dm = DistributionMap::new(vec![0]);
    let mut fr = FluxRegister::new(fine_ba, dm.clone(), crse_ba, dm, 2, 1, 0).unwrap();

    let o = Orientation::new(0, Side::Lo);
    fr.store(o, 0, |c, _| c.get(1) as f64).unwrap();

    let transport = SingleRank::default();
    fr.communicate(&transport).unwrap();

    let crse = fr.load(o, 0).unwrap();
    for j in 0..=1i64 {
        let expected = 2.0 * j as f64 + 0.5;
        assert_eq!(crse.get(&IntVect::new(&[0, j]).unwrap(), 0), expected);
    }
}
