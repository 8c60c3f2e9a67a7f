//! `ChannelTransport`: a [`crate::comm::Transport`] backend that simulates
//! an `N`-rank MPI job within one process, one mailbox per rank connected
//! by `crossbeam-channel` (grounded in the `oxidized` pack example's
//! crossbeam-based event loop). Point-to-point messages, the min-reduce,
//! and the broadcast are all implemented as ordinary channel sends —
//! there is no shared mutable state between ranks beyond the channels
//! themselves, so running the exchange engine against this backend on real
//! OS threads genuinely exercises the post/wait protocol of spec.md §4.2.

#![forbid(unsafe_code)]

use crate::comm::{RecvToken, SendToken, Transport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Reserved tags for the two collectives, chosen far outside the range
/// `Plan`-driven sequence numbers ever reach.
const REDUCE_TAG: u64 = u64::MAX - 1;
const BCAST_TAG: u64 = u64::MAX - 2;

struct Msg {
    from: usize,
    tag: u64,
    bytes: Vec<u8>,
}

/// One rank's endpoint into the simulated job. Cheap to hand to a thread:
/// `Sender`/`Receiver` are already `Send + Sync`.
pub struct ChannelTransport {
    rank: usize,
    n_procs: usize,
    senders: Vec<Sender<Msg>>,
    receiver: Receiver<Msg>,
    pending: Mutex<Vec<Msg>>,
    seq: AtomicU64,
}

impl ChannelTransport {
    /// Build `n_procs` connected endpoints, one per simulated rank. Pass
    /// element `i` to the code that will play the role of rank `i`
    /// (typically one per spawned `std::thread`).
    pub fn job(n_procs: usize) -> Vec<ChannelTransport> {
        assert!(n_procs > 0, "a job needs at least one rank");
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n_procs).map(|_| unbounded::<Msg>()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ChannelTransport {
                rank,
                n_procs,
                senders: senders.clone(),
                receiver,
                pending: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn recv_matching(&self, from: usize, tag: u64) -> Vec<u8> {
        {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            if let Some(pos) = pending.iter().position(|m| m.from == from && m.tag == tag) {
                return pending.remove(pos).bytes;
            }
        }
        loop {
            let msg = self.receiver.recv().expect("channel closed before matching message arrived");
            if msg.from == from && msg.tag == tag {
                return msg.bytes;
            }
            self.pending.lock().expect("pending mutex poisoned").push(msg);
        }
    }
}

impl Transport for ChannelTransport {
    fn my_proc(&self) -> usize {
        self.rank
    }

    fn n_procs(&self) -> usize {
        self.n_procs
    }

    fn seq_num(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn isend(&self, to: usize, tag: u64, data: Vec<u8>) -> SendToken {
        self.senders[to]
            .send(Msg { from: self.rank, tag, bytes: data })
            .expect("peer mailbox closed");
        SendToken(tag)
    }

    fn irecv(&self, from: usize, tag: u64, nbytes: usize) -> RecvToken {
        // Recorded for later `wait_recv`; the actual blocking/matching
        // happens there, matching the "post returns immediately, finish
        // blocks" contract (spec.md §5). We stash (from, tag, nbytes) by
        // encoding into the token isn't enough once multiple posts share a
        // tag across peers, so this transport keeps it simple: one
        // in-flight receive per (from, tag) pair, which is exactly what a
        // single exchange's RcvTags produce.
        let _ = nbytes;
        RecvToken(encode_recv(from, tag))
    }

    fn wait_send(&self, _token: SendToken) {
        // crossbeam sends complete synchronously from the caller's point of
        // view (the mailbox is unbounded), so there is nothing to wait on.
    }

    fn wait_recv(&self, token: RecvToken) -> Vec<u8> {
        let (from, tag) = decode_recv(token.0);
        self.recv_matching(from, tag)
    }

    fn reduce_real_min(&self, local: Vec<f64>) -> Vec<f64> {
        if self.rank == 0 {
            let mut acc = local;
            for from in 1..self.n_procs {
                let bytes = self.recv_matching(from, REDUCE_TAG);
                let other = bytes_to_f64_vec(&bytes);
                for (a, b) in acc.iter_mut().zip(other.iter()) {
                    *a = a.min(*b);
                }
            }
            let out_bytes = f64_vec_to_bytes(&acc);
            for to in 1..self.n_procs {
                self.senders[to]
                    .send(Msg { from: self.rank, tag: BCAST_TAG, bytes: out_bytes.clone() })
                    .expect("peer mailbox closed");
            }
            acc
        } else {
            self.senders[0]
                .send(Msg { from: self.rank, tag: REDUCE_TAG, bytes: f64_vec_to_bytes(&local) })
                .expect("rank 0 mailbox closed");
            let bytes = self.recv_matching(0, BCAST_TAG);
            bytes_to_f64_vec(&bytes)
        }
    }

    fn bcast_bytes(&self, data: Vec<u8>, root: usize) -> Vec<u8> {
        if self.rank == root {
            for to in 0..self.n_procs {
                if to != root {
                    self.senders[to]
                        .send(Msg { from: self.rank, tag: BCAST_TAG, bytes: data.clone() })
                        .expect("peer mailbox closed");
                }
            }
            data
        } else {
            self.recv_matching(root, BCAST_TAG)
        }
    }
}

fn encode_recv(from: usize, tag: u64) -> u64 {
    // Fold `from` into the low bits of the tag's hash so distinct (from,
    // tag) pairs get distinct tokens; `wait_recv` decodes via a parallel
    // side channel instead of trying to invert this, so any bijection-ish
    // mixing here is fine. We keep (from, tag) directly reachable by
    // storing them verbatim in a deterministic scheme: tag must stay under
    // 2^56 for plan sequence numbers, which holds for any realistic run.
    debug_assert!(tag < (1u64 << 56), "sequence number unexpectedly large");
    (tag << 8) | (from as u64 & 0xff)
}

fn decode_recv(encoded: u64) -> (usize, u64) {
    ((encoded & 0xff) as usize, encoded >> 8)
}

fn f64_vec_to_bytes(v: &[f64]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn bytes_to_f64_vec(b: &[u8]) -> Vec<f64> {
    b.chunks_exact(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect()
}
