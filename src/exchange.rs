//! The halo-exchange engine: turns an [`FbPlan`] into actual bytes moving
//! between ranks, split into `nowait` (post) and `finish` (wait + unpack)
//! phases so a caller can overlap other work with the network round trip
//! (spec.md §4.2, §5).
//!
//! Every in-flight exchange is represented by an opaque [`PendingExchange`]
//! value rather than process-wide mutable fields — the redesign spec.md §9
//! asks for, since nothing stops a caller from having two exchanges open
//! against two different `FabArray`s at once.

#![forbid(unsafe_code)]

use crate::arena::{alignof_comm_data, HostArena};
use crate::boxarray::BoxId;
use crate::comm::{RecvToken, SendToken, Transport};
use rayon::iter::ParallelIterator;
use crate::fab::{FabArray, FabError, UnpackOp};
use crate::plan::{CopyComTag, FbPlan};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Fab(#[from] FabError),
}

/// An exchange that has been posted but not yet completed. Opaque on
/// purpose: the only thing a caller can do with one is hand it to
/// [`fill_boundary_finish`].
pub struct PendingExchange {
    send_tokens: Vec<SendToken>,
    recv_posts: Vec<(RecvToken, Vec<CopyComTag>)>,
}

fn apply_loc_tags(fa: &mut FabArray, tags: &[CopyComTag], ncomp: usize) -> Result<(), ExchangeError> {
    // Pack then unpack through a scratch buffer rather than taking two
    // simultaneous borrows into `fa`'s tile map — this also makes the
    // `src_index == dst_index` case (a tile periodic-wrapping onto itself)
    // fall out for free instead of needing special-cased aliasing logic.
    for t in tags {
        let mut buf = Vec::new();
        {
            let src = fa.get(t.src_index)?;
            src.pack_into(&t.sbox, 0, ncomp, &mut buf)?;
        }
        let dst = fa.get_mut(t.dst_index)?;
        dst.unpack_from(&t.dbox, 0, ncomp, &buf, UnpackOp::Copy)?;
    }
    Ok(())
}

/// Post the network half of a fill-boundary exchange and perform every
/// purely-local copy, which overlaps with the in-flight sends/receives
/// (spec.md §4.2's "local copies run while the network is in flight").
///
/// Short-circuits to a local-only pass when there is nothing to
/// communicate: a single-rank run, or a plan with no cross-rank tags.
pub fn fill_boundary_nowait(
    fa: &mut FabArray,
    transport: &dyn Transport,
    arena: &HostArena,
    plan: &FbPlan,
) -> Result<PendingExchange, ExchangeError> {
    let ncomp = fa.ncomp();

    if transport.n_procs() == 1 {
        apply_loc_tags(fa, &plan.loc, ncomp)?;
        return Ok(PendingExchange { send_tokens: Vec::new(), recv_posts: Vec::new() });
    }

    // Every rank in a multi-rank job must draw exactly one sequence number
    // per exchange, even one with nothing to send or receive locally, or a
    // rank with an empty plan falls behind its peers (spec.md §5, §7).
    let tag = transport.seq_num();
    tracing::trace!(tag, n_send = plan.snd.len(), n_recv = plan.rcv.len(), "posting fill-boundary exchange");

    if plan.snd.is_empty() && plan.rcv.is_empty() {
        apply_loc_tags(fa, &plan.loc, ncomp)?;
        return Ok(PendingExchange { send_tokens: Vec::new(), recv_posts: Vec::new() });
    }

    // Receives are posted before sends so a peer's message always finds a
    // buffer already waiting for it.
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
            let f = fa.get(t.src_index)?;
            f.pack_into(&t.sbox, 0, ncomp, &mut buf)?;
        }
        send_tokens.push(transport.isend(to, tag, buf));
    }

    apply_loc_tags(fa, &plan.loc, ncomp)?;

    Ok(PendingExchange { send_tokens, recv_posts })
}

/// Block for every posted receive, unpack the results, then drain the
/// outstanding sends.
///
/// Unpacking is partitioned by destination tile via
/// [`FabArray::par_iter_mut`]: every tile is visited by exactly one rayon
/// task, so concurrent incoming messages for different tiles unpack in
/// parallel with no aliasing, independent of `plan.threadsafe_rcv` (that
/// flag matters to a caller unpacking a flatter, non-tile-partitioned way).
pub fn fill_boundary_finish(fa: &mut FabArray, transport: &dyn Transport, pending: PendingExchange) -> Result<(), ExchangeError> {
    tracing::trace!(n_recv = pending.recv_posts.len(), n_send = pending.send_tokens.len(), "waiting on fill-boundary exchange");
    let ncomp = fa.ncomp();

    let mut by_dst: HashMap<BoxId, Vec<(usize, usize, CopyComTag)>> = HashMap::new();
    let mut peer_bytes: Vec<Vec<u8>> = Vec::with_capacity(pending.recv_posts.len());
    for (peer_idx, (token, tags)) in pending.recv_posts.into_iter().enumerate() {
        let bytes = transport.wait_recv(token);
        let mut offset = 0usize;
        for t in &tags {
            let len = t.dbox.num_pts() as usize * ncomp * 8;
            by_dst.entry(t.dst_index).or_default().push((peer_idx, offset, *t));
            offset += len;
        }
        peer_bytes.push(bytes);
    }

    let unpack_err = std::sync::Mutex::new(None);
    fa.par_iter_mut().for_each(|(id, f)| {
        let Some(entries) = by_dst.get(id) else { return };
        for (peer_idx, offset, t) in entries {
            let len = t.dbox.num_pts() as usize * ncomp * 8;
            let slice = &peer_bytes[*peer_idx][*offset..*offset + len];
            if let Err(e) = f.unpack_from(&t.dbox, 0, ncomp, slice, UnpackOp::Copy) {
                *unpack_err.lock().unwrap() = Some(e);
            }
        }
    });
    if let Some(e) = unpack_err.into_inner().unwrap() {
        return Err(e.into());
    }

    for token in pending.send_tokens {
        transport.wait_send(token);
    }
    Ok(())
}

/// Convenience wrapper for callers with nothing to overlap: post and
/// immediately finish.
pub fn fill_boundary(fa: &mut FabArray, transport: &dyn Transport, arena: &HostArena, plan: &FbPlan) -> Result<(), ExchangeError> {
    let pending = fill_boundary_nowait(fa, transport, arena, plan)?;
    fill_boundary_finish(fa, transport, pending)
}
