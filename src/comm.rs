//! `Transport`: the collaborator interface standing in for AMReX's
//! `ParallelDescriptor` (spec.md §6) — rank identity, a per-communicator
//! sequence number, non-blocking point-to-point send/receive, and the two
//! collectives the EB reductions need (`ReduceRealMin`, `Bcast`).
//!
//! This crate ships two backends: [`SingleRank`] for the `NProcs() == 1`
//! fast path, and [`crate::channel::ChannelTransport`] which simulates a
//! multi-rank job with one OS thread per rank so the exchange engine's
//! post/wait protocol is genuinely exercised in tests without linking a
//! real MPI implementation.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle returned by [`Transport::isend`]; consumed by
/// [`Transport::wait_send`]. Mirrors the two-phase `nowait`/`finish` split
/// of spec.md §4.2 and §9's "opaque token, not process-wide fields" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendToken(pub(crate) u64);

/// Opaque handle returned by [`Transport::irecv`]; consumed by
/// [`Transport::wait_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvToken(pub(crate) u64);

/// A rank's view of the process group: identity, messaging, and the two
/// collectives used outside the exchange path.
pub trait Transport: Send + Sync {
    fn my_proc(&self) -> usize;
    fn n_procs(&self) -> usize;

    /// Draw the next value from this rank's sequence-number generator.
    /// Every rank must call this (directly or via the exchange engine) the
    /// same number of times in the same order, or tags desynchronize
    /// (spec.md §5, "sequence-number alignment").
    fn seq_num(&self) -> u64;

    /// Post a non-blocking send of `data` to rank `to`, tagged `tag`.
    /// Returns immediately (spec.md §5: "MPI posts return immediately").
    fn isend(&self, to: usize, tag: u64, data: Vec<u8>) -> SendToken;

    /// Post a non-blocking receive of `nbytes` bytes from rank `from`,
    /// tagged `tag`. Returns immediately; the bytes are retrieved by
    /// [`Transport::wait_recv`].
    fn irecv(&self, from: usize, tag: u64, nbytes: usize) -> RecvToken;

    /// Block until the send named by `token` has been handed off.
    fn wait_send(&self, token: SendToken);

    /// Block until the receive named by `token` has arrived, returning its
    /// bytes. This is the sole blocking point in the exchange path
    /// (spec.md §5).
    fn wait_recv(&self, token: RecvToken) -> Vec<u8>;

    /// Best-effort non-blocking progress kick (spec.md §4.2e). A transport
    /// that makes progress purely on `wait_*` may implement this as a
    /// no-op; omitting the kick must never affect correctness, only
    /// latency (spec.md §9).
    fn test_progress(&self) {}

    /// Elementwise minimum of `local` across every rank; every rank gets
    /// the same result vector.
    fn reduce_real_min(&self, local: Vec<f64>) -> Vec<f64>;

    /// Broadcast `data` from `root` to every rank; non-root callers' input
    /// is ignored and replaced by the broadcast payload.
    fn bcast_bytes(&self, data: Vec<u8>, root: usize) -> Vec<u8>;
}

/// Fast-path transport for a single-process run: no peers, so every
/// send/recv call is a programming error. `reduce_real_min`/`bcast_bytes`
/// degenerate to identity, matching what a real 1-rank MPI job would do.
pub struct SingleRank {
    seq: AtomicU64,
}

impl Default for SingleRank {
    fn default() -> Self {
        Self { seq: AtomicU64::new(0) }
    }
}

impl Transport for SingleRank {
    fn my_proc(&self) -> usize {
        0
    }
    fn n_procs(&self) -> usize {
        1
    }
    fn seq_num(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
    fn isend(&self, _to: usize, _tag: u64, _data: Vec<u8>) -> SendToken {
        unreachable!("SingleRank transport has no peers to send to")
    }
    fn irecv(&self, _from: usize, _tag: u64, _nbytes: usize) -> RecvToken {
        unreachable!("SingleRank transport has no peers to receive from")
    }
    fn wait_send(&self, _token: SendToken) {
        unreachable!("SingleRank transport never issues sends")
    }
    fn wait_recv(&self, _token: RecvToken) -> Vec<u8> {
        unreachable!("SingleRank transport never issues receives")
    }
    fn reduce_real_min(&self, local: Vec<f64>) -> Vec<f64> {
        local
    }
    fn bcast_bytes(&self, data: Vec<u8>, _root: usize) -> Vec<u8> {
        data
    }
}
