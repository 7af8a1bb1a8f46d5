//! The translation-block record and its compile-time identity.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::arena::HostBlockId;

/// Number of direct-jump exit slots a block may carry (a conditional branch
/// has a taken and a not-taken edge).
pub const TB_JUMP_SLOTS: usize = 2;

/// Compile flags: part of a TB's identity key.
///
/// The low 16 bits carry an exact instruction-count request (0 = unbounded);
/// the engine uses it to compile blocks truncated to the remaining
/// deterministic-execution budget, and to force single-instruction blocks
/// for exclusive execution. The upper bits select compilation variants that
/// must not share cache entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompileFlags(u32);

impl CompileFlags {
    /// Mask of the exact instruction-count field.
    pub const COUNT_MASK: u32 = 0xffff;
    /// The block cooperates with the deterministic instruction counter
    /// (budget test in the prologue).
    pub const USE_ICOUNT: u32 = 1 << 16;
    /// The block was compiled for multi-CPU execution (atomics honored).
    pub const PARALLEL: u32 = 1 << 17;

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Exact instruction count requested from the generator; 0 means the
    /// generator picks the block length.
    #[inline]
    pub const fn count(self) -> u16 {
        (self.0 & Self::COUNT_MASK) as u16
    }

    #[inline]
    pub const fn with_count(self, count: u16) -> Self {
        Self((self.0 & !Self::COUNT_MASK) | count as u32)
    }

    #[inline]
    pub const fn use_icount(self) -> bool {
        self.0 & Self::USE_ICOUNT != 0
    }

    #[inline]
    pub const fn with_use_icount(self) -> Self {
        Self(self.0 | Self::USE_ICOUNT)
    }

    #[inline]
    pub const fn parallel(self) -> bool {
        self.0 & Self::PARALLEL != 0
    }

    #[inline]
    pub const fn with_parallel(self) -> Self {
        Self(self.0 | Self::PARALLEL)
    }

    #[inline]
    pub const fn without_parallel(self) -> Self {
        Self(self.0 & !Self::PARALLEL)
    }
}

impl fmt::Debug for CompileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompileFlags({:#x})", self.0)
    }
}

/// Index of a translation block in the shared [`crate::cache::TbCache`].
///
/// Ids are never reused; stale ids (after invalidation or flush) simply stop
/// resolving. Together with a slot index, a `TbId` replaces the
/// tagged-pointer incoming-jump lists of pointer-based translators.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TbId(u32);

impl TbId {
    const NONE_BITS: u32 = u32::MAX;

    #[inline]
    pub(crate) fn new(index: u32) -> Self {
        debug_assert_ne!(index, Self::NONE_BITS);
        Self(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw bits, suitable for storage in a patched exit word.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits != Self::NONE_BITS).then_some(Self(bits))
    }
}

/// One incoming direct jump: `from`'s `slot`-th exit was patched to enter
/// this block. Threaded through the *target* so invalidation can restore
/// every caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IncomingEdge {
    pub from: TbId,
    pub slot: usize,
}

/// An outgoing direct-jump slot.
///
/// `dest` transitions empty -> claimed exactly once via compare-and-set;
/// only an explicit unlink clears it. `reset_word` is the exit word in the
/// host block that the patcher rewrites; `None` means the generator emitted
/// no direct branch for this edge (indirect exit only).
#[derive(Debug)]
pub struct JumpSlot {
    dest: AtomicU32,
    reset_word: Option<u32>,
    deferred_unlink: AtomicBool,
}

impl JumpSlot {
    fn new(reset_word: Option<u32>) -> Self {
        Self {
            dest: AtomicU32::new(TbId::NONE_BITS),
            reset_word,
            deferred_unlink: AtomicBool::new(false),
        }
    }
}

/// Everything the code generator hands back for a freshly compiled block,
/// plus the identity key the engine looked up. The cache turns this into a
/// [`TranslationBlock`].
#[derive(Debug, Clone)]
pub struct TbDesc {
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u32,
    pub cflags: CompileFlags,
    /// Compiled guest instruction count.
    pub icount: u16,
    /// Backing pages the block reads code from; `page_addr[1]` is set when
    /// the block spans a page boundary.
    pub page_addr: [Option<u64>; 2],
    pub code: HostBlockId,
    /// Per-slot exit word indices; `None` disables direct chaining on that
    /// edge.
    pub jmp_reset_word: [Option<u32>; TB_JUMP_SLOTS],
}

/// A compiled translation block.
///
/// The identity key (`pc`, `cs_base`, `flags`, `cflags`, `page_addr[0]`) is
/// immutable after creation. Mutable state is confined to the jump slots
/// (atomics), the incoming-patch list (per-TB mutex) and the validity flag.
#[derive(Debug)]
pub struct TranslationBlock {
    id: TbId,
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u32,
    pub cflags: CompileFlags,
    pub icount: u16,
    pub page_addr: [Option<u64>; 2],
    pub code: HostBlockId,
    jmp: [JumpSlot; TB_JUMP_SLOTS],
    incoming: Mutex<Vec<IncomingEdge>>,
    valid: AtomicBool,
}

impl TranslationBlock {
    pub(crate) fn new(id: TbId, desc: TbDesc) -> Self {
        Self {
            id,
            pc: desc.pc,
            cs_base: desc.cs_base,
            flags: desc.flags,
            cflags: desc.cflags,
            icount: desc.icount,
            page_addr: desc.page_addr,
            code: desc.code,
            jmp: [
                JumpSlot::new(desc.jmp_reset_word[0]),
                JumpSlot::new(desc.jmp_reset_word[1]),
            ],
            incoming: Mutex::new(Vec::new()),
            valid: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn id(&self) -> TbId {
        self.id
    }

    /// False once the block has been invalidated; an invalid block must
    /// never be entered and is unlinked from every caller before its code
    /// can be reclaimed.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// True when the block reads code from two guest pages. Such blocks are
    /// never chained into: the mapping of the second page can change
    /// independently.
    #[inline]
    pub fn spans_two_pages(&self) -> bool {
        self.page_addr[1].is_some()
    }

    /// Current direct-jump destination of `slot`, if patched.
    #[inline]
    pub fn jump_dest(&self, slot: usize) -> Option<TbId> {
        TbId::from_bits(self.jmp[slot].dest.load(Ordering::Acquire))
    }

    /// Exit word the patcher rewrites for `slot`; `None` means the edge
    /// cannot be chained directly.
    #[inline]
    pub fn jump_reset_word(&self, slot: usize) -> Option<u32> {
        self.jmp[slot].reset_word
    }

    /// Atomically claims `slot` for `dest`. First patcher wins; all losers
    /// observe `false` and must not touch the host code.
    pub(crate) fn claim_jump(&self, slot: usize, dest: TbId) -> bool {
        self.jmp[slot]
            .dest
            .compare_exchange(
                TbId::NONE_BITS,
                dest.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn clear_jump(&self, slot: usize) {
        self.jmp[slot].dest.store(TbId::NONE_BITS, Ordering::Release);
    }

    /// Marks `slot` for deferred unlink, applied at the owner's next safe
    /// point. Used when the unlinker cannot take the target's jump lock
    /// immediately.
    pub(crate) fn signal_unlink(&self, slot: usize) {
        self.jmp[slot].deferred_unlink.store(true, Ordering::Release);
    }

    pub(crate) fn take_unlink_signal(&self, slot: usize) -> bool {
        self.jmp[slot].deferred_unlink.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn incoming(&self) -> &Mutex<Vec<IncomingEdge>> {
        &self.incoming
    }
}
