//! Distributed halo-exchange and flux-register engine for block-structured
//! AMR fab-arrays.
//!
//! # Layering
//! - [`index`] — integer vectors, rectangular index boxes, periodicity.
//! - [`boxarray`] / [`distmap`] — the layout: where tiles live in index
//!   space, and which rank owns each one.
//! - [`fab`] — the data: dense numeric tiles with ghost halos.
//! - [`plan`] — cached [`plan::CopyComTag`] lists describing which cell
//!   regions move between which tiles.
//! - [`comm`] / [`channel`] / [`arena`] — the transport a plan is executed
//!   over, and the pack/unpack buffers it needs.
//! - [`exchange`] — fill-boundary: ghost cells filled from neighboring
//!   tiles of the same layout.
//! - [`parcopy`] — parallel-copy: data moved between two independently
//!   laid-out `FabArray`s.
//! - [`fluxreg`] — coarse/fine conservative flux reconciliation.
//! - [`eb`] — embedded-boundary-aware reductions and averaging.
//!
//! # Lifecycle
//! There is deliberately no process-wide mutable state here: a
//! [`comm::Transport`], a [`arena::HostArena`], and a [`plan::PlanCache`]
//! are all plain values a caller constructs and owns for as long as it
//! needs them. A `FabArray` can never outlive the transport or cache it
//! was built against because nothing lets it reach for them implicitly —
//! every operation that needs one takes it as an explicit argument. That
//! makes "finalize" just the ordinary end of that scope; see DESIGN.md for
//! why this crate took that path instead of the original design's implicit
//! process-wide singletons.
//!
//! # Invariants carried from module to module
//! - Index boxes and fabs never move or resize; a `FabArray`'s
//!   `(BoxArray, DistributionMap, ncomp, nghost)` are fixed for its life.
//! - A plan is a pure function of its structural key (layout, ghost width,
//!   periodicity, variant, and the executing rank); two calls with the same
//!   key always produce the same tags, which is what makes caching sound.
//! - Every communication primitive here is safe Rust: `#![forbid(unsafe_code)]`
//!   is set in every module, including the simulated multi-rank transport.

#![forbid(unsafe_code)]

pub mod arena;
pub mod boxarray;
pub mod channel;
pub mod comm;
pub mod distmap;
pub mod eb;
pub mod exchange;
pub mod fab;
pub mod fluxreg;
pub mod index;
pub mod parcopy;
pub mod plan;

pub use boxarray::{BoxArray, BoxArrayError, BoxId};
pub use distmap::{DistMapError, DistributionMap};
pub use fab::{Fab, FabArray, FabError, UnpackOp};
pub use index::{Centering, IndexBox, IndexError, IntVect, Orientation, Periodicity, Side};
pub use plan::{CopyComTag, CpcPlan, FbPlan, PlanCache, PlanError};
