//! Translation-block bookkeeping for the dynamic binary translation engine.
//!
//! A *translation block* (TB) is a unit of host code compiled from a
//! contiguous run of guest instructions, valid only for a specific guest
//! context. This crate owns everything about TBs except their contents:
//!
//! - [`arena::CodeArena`]: the host-code arena. Generated code is opaque to
//!   this crate; the arena only models the *patchable exit words* each block
//!   carries out-of-band, so exit branches can be rewritten ("chained") to
//!   jump straight into a successor block without raw writes into executable
//!   bytes.
//! - [`block::TranslationBlock`]: the TB record: identity key, compiled
//!   instruction count, backing guest pages, jump slots, incoming-patch list
//!   and validity flag.
//! - [`cache::TbCache`]: the shared TB index (hash over identity key plus
//!   backing address) and the page map used to invalidate TBs when guest
//!   code is overwritten.
//! - [`lookaside::Lookaside`]: the small per-CPU direct-mapped cache probed
//!   before the full index.
//! - [`link`]: the jump patch manager: atomic slot claims, host-code
//!   patching, unlink on invalidation and the deferred two-phase unlink.
//!
//! Concurrency contract: lookups are reader-side only; structural changes
//! (insert/invalidate/flush) are serialized by the execution engine's
//! generation lock on top of the interior `RwLock`s here. Per-TB state is
//! guarded by jump-slot atomics plus the TB's own incoming-patch mutex, held
//! only for O(1) critical sections.

pub mod arena;
pub mod block;
pub mod cache;
pub mod link;
pub mod lookaside;

pub use arena::{CodeArena, CodeArenaError, ExecView, HostBlockId, EXIT_TO_DISPATCH};
pub use block::{CompileFlags, IncomingEdge, TbDesc, TbId, TranslationBlock, TB_JUMP_SLOTS};
pub use cache::{TbCache, TbKey};
pub use link::LinkOutcome;
pub use lookaside::Lookaside;

/// Guest page granularity used for code invalidation tracking.
pub const GUEST_PAGE_SIZE: u64 = 4096;

/// Returns the page address containing `addr`.
#[inline]
pub fn page_of(addr: u64) -> u64 {
    addr & !(GUEST_PAGE_SIZE - 1)
}

/// Returns the first page address strictly above `addr`'s page, i.e. the
/// page a multi-page block spills into.
#[inline]
pub fn next_page(addr: u64) -> u64 {
    page_of(addr).wrapping_add(GUEST_PAGE_SIZE)
}
