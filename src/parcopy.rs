//! `ParallelCopy`: move (or accumulate) components between two
//! [`FabArray`]s that may have completely different `BoxArray`/
//! `DistributionMap` layouts (spec.md §4.3). Built on the same
//! [`CopyComTag`]-binning machinery as fill-boundary, via a [`CpcPlan`]
//! instead of an [`FbPlan`].

#![forbid(unsafe_code)]

use crate::arena::{alignof_comm_data, HostArena};
use crate::boxarray::BoxId;
use crate::comm::Transport;
use rayon::iter::ParallelIterator;
use crate::exchange::ExchangeError;
use crate::fab::{FabArray, UnpackOp};
use crate::plan::{build_cpc_plan, CopyComTag, CpcPlan, PlanError};
use std::collections::HashMap;

/// Components are packed in chunks of at most this many at once so a
/// single parallel-copy call on a wide `FabArray` doesn't have to hold one
/// giant buffer per peer in flight (spec.md §4.3's `MaxComp` note).
pub const MAX_COMP_CHUNK: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum ParCopyError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Copy `ncomp` components starting at `scomp` in `src` into `dst` starting
/// at `dcomp`, over `dst`'s `grow(box, dnghost)` region sourced from
/// `src`'s `grow(box, snghost)` region, reduced into `dst` with `op`.
pub fn parallel_copy(
    dst: &mut FabArray,
    src: &FabArray,
    scomp: usize,
    dcomp: usize,
    ncomp: usize,
    transport: &dyn Transport,
    arena: &HostArena,
    plan: &CpcPlan,
    op: UnpackOp,
) -> Result<(), ParCopyError> {
    let mut done = 0;
    while done < ncomp {
        let chunk = (ncomp - done).min(MAX_COMP_CHUNK);
        parallel_copy_chunk(dst, src, scomp + done, dcomp + done, chunk, transport, arena, plan, op)?;
        done += chunk;
    }
    Ok(())
}

/// Build the [`CpcPlan`] for `dst`/`src` under `(snghost, dnghost, period)`
/// and run [`parallel_copy`] against it — for callers that aren't keeping
/// their own plan cache.
#[allow(clippy::too_many_arguments)]
pub fn parallel_copy_uncached(
    dst: &mut FabArray,
    src: &FabArray,
    scomp: usize,
    dcomp: usize,
    ncomp: usize,
    snghost: crate::index::IntVect,
    dnghost: crate::index::IntVect,
    period: &crate::index::Periodicity,
    transport: &dyn Transport,
    arena: &HostArena,
    op: UnpackOp,
) -> Result<(), ParCopyError> {
    let plan = build_cpc_plan(
        dst.box_array(),
        dst.distribution_map(),
        dnghost,
        src.box_array(),
        src.distribution_map(),
        snghost,
        period,
        transport.my_proc(),
    )?;
    parallel_copy(dst, src, scomp, dcomp, ncomp, transport, arena, &plan, op)
}

fn parallel_copy_chunk(
    dst: &mut FabArray,
    src: &FabArray,
    scomp: usize,
    dcomp: usize,
    ncomp: usize,
    transport: &dyn Transport,
    arena: &HostArena,
    plan: &CpcPlan,
    op: UnpackOp,
) -> Result<(), ParCopyError> {
    // Local transfers (same rank on both ends) never touch the network.
    for t in &plan.loc {
        let mut buf = Vec::new();
        {
            let sf = src.get(t.src_index).map_err(ExchangeError::from)?;
            sf.pack_into(&t.sbox, scomp, ncomp, &mut buf).map_err(ExchangeError::from)?;
        }
        let df = dst.get_mut(t.dst_index).map_err(ExchangeError::from)?;
        df.unpack_from(&t.dbox, dcomp, ncomp, &buf, op).map_err(ExchangeError::from)?;
    }

    if transport.n_procs() == 1 {
        return Ok(());
    }

    // Every rank draws one sequence number per chunk, even a chunk with no
    // cross-rank tags on this rank — all ranks iterate the same number of
    // `MAX_COMP_CHUNK`-sized chunks, so a skipped draw desynchronizes the
    // next chunk's (or next call's) tags (spec.md §5, §7).
    let tag = transport.seq_num();
    if plan.snd.is_empty() && plan.rcv.is_empty() {
        return Ok(());
    }

    let mut recv_posts = Vec::with_capacity(plan.rcv.len());
    for (&from, tags) in &plan.rcv {
        let nbytes: usize = tags.iter().map(|t| t.dbox.num_pts() as usize * ncomp * 8).sum();
        recv_posts.push((transport.irecv(from, tag, nbytes), tags.clone()));
    }

    let mut send_tokens = Vec::with_capacity(plan.snd.len());
    for (&to, tags) in &plan.snd {
        let nbytes: usize = tags.iter().map(|t| t.sbox.num_pts() as usize * ncomp * 8).sum();
        let mut buf = arena.alloc(alignof_comm_data(nbytes));
        buf.clear();
        for t in tags {
            let sf = src.get(t.src_index).map_err(ExchangeError::from)?;
            sf.pack_into(&t.sbox, scomp, ncomp, &mut buf).map_err(ExchangeError::from)?;
        }
        send_tokens.push(transport.isend(to, tag, buf));
    }

    let mut by_dst: HashMap<BoxId, Vec<(usize, usize, CopyComTag)>> = HashMap::new();
    let mut peer_bytes: Vec<Vec<u8>> = Vec::with_capacity(recv_posts.len());
    for (peer_idx, (token, tags)) in recv_posts.into_iter().enumerate() {
        let bytes = transport.wait_recv(token);
        let mut offset = 0usize;
        for t in &tags {
            let len = t.dbox.num_pts() as usize * ncomp * 8;
            by_dst.entry(t.dst_index).or_default().push((peer_idx, offset, *t));
            offset += len;
        }
        peer_bytes.push(bytes);
    }

    let err = std::sync::Mutex::new(None);
    dst.par_iter_mut().for_each(|(id, f)| {
        let Some(entries) = by_dst.get(id) else { return };
        for (peer_idx, offset, t) in entries {
            let len = t.dbox.num_pts() as usize * ncomp * 8;
            let slice = &peer_bytes[*peer_idx][*offset..*offset + len];
            if let Err(e) = f.unpack_from(&t.dbox, dcomp, ncomp, slice, op) {
                *err.lock().unwrap() = Some(e);
            }
        }
    });
    if let Some(e) = err.into_inner().unwrap() {
        return Err(ExchangeError::from(e).into());
    }

    for token in send_tokens {
        transport.wait_send(token);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxarray::BoxArray;
    use crate::comm::SingleRank;
    use crate::distmap::DistributionMap;
    use crate::index::{Centering, IndexBox, IntVect, Periodicity};

    fn bx(lo: [i64; 2], hi: [i64; 2]) -> IndexBox {
        IndexBox::new(IntVect::new(&lo).unwrap(), IntVect::new(&hi).unwrap(), Centering::Cell).unwrap()
    }

    #[test]
    fn copy_between_mismatched_layouts_same_rank() {
        // Source: one big tile [0,7]x[0,7] on rank 0.
        // Destination: split into four quadrants, still all on rank 0 —
        // exercises the CPC plan's cross-tile local copy path.
        let src_ba = BoxArray::new(vec![bx([0, 0], [7, 7])]).unwrap();
        let src_dm = DistributionMap::new(vec![0]);
        let dst_ba = BoxArray::new(vec![
            bx([0, 0], [3, 3]),
            bx([4, 0], [7, 3]),
            bx([0, 4], [3, 7]),
            bx([4, 4], [7, 7]),
        ])
        .unwrap();
        let dst_dm = DistributionMap::new(vec![0, 0, 0, 0]);
        let zero = IntVect::new(&[0, 0]).unwrap();

        let mut src = FabArray::new(src_ba.clone(), src_dm.clone(), 1, zero, 0).unwrap();
        src.get_mut(0).unwrap().fill_with(&bx([0, 0], [7, 7]), |c, _| (c.get(0) * 10 + c.get(1)) as f64);
        let mut dst = FabArray::new(dst_ba.clone(), dst_dm.clone(), 1, zero, 0).unwrap();

        let transport = SingleRank::default();
        let arena = HostArena::default();
        let period = Periodicity::non_periodic(2);
        parallel_copy_uncached(&mut dst, &src, 0, 0, 1, zero, zero, &period, &transport, &arena, UnpackOp::Copy).unwrap();

        for (id, box_) in dst_ba.iter() {
            for x in box_.lo().get(0)..=box_.hi().get(0) {
                for y in box_.lo().get(1)..=box_.hi().get(1) {
                    let c = IntVect::new(&[x, y]).unwrap();
                    assert_eq!(dst.get(id).unwrap().get(&c, 0), (x * 10 + y) as f64);
                }
            }
        }
    }

    #[test]
    fn add_op_accumulates_into_existing_destination_values() {
        let src_ba = BoxArray::new(vec![bx([0, 0], [1, 1])]).unwrap();
        let dst_ba = BoxArray::new(vec![bx([0, 0], [1, 1])]).unwrap();
        let dm = DistributionMap::new(vec![0]);
        let zero = IntVect::new(&[0, 0]).unwrap();

        let mut src = FabArray::new(src_ba.clone(), dm.clone(), 1, zero, 0).unwrap();
        src.get_mut(0).unwrap().fill_with(&bx([0, 0], [1, 1]), |_, _| 5.0);
        let mut dst = FabArray::new(dst_ba.clone(), dm.clone(), 1, zero, 0).unwrap();
        dst.get_mut(0).unwrap().fill_with(&bx([0, 0], [1, 1]), |_, _| 1.0);

        let transport = SingleRank::default();
        let arena = HostArena::default();
        let period = Periodicity::non_periodic(2);
        parallel_copy_uncached(&mut dst, &src, 0, 0, 1, zero, zero, &period, &transport, &arena, UnpackOp::Add).unwrap();

        assert_eq!(dst.get(0).unwrap().get(&IntVect::new(&[0, 0]).unwrap(), 0), 6.0);
    }
}
