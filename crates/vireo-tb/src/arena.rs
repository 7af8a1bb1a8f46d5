//! Host-code arena with out-of-band patch slots.
//!
//! The code generator (an external collaborator) emits host code for each
//! translation block and registers the block here. The arena does not model
//! the code bytes themselves, only the block's *exit words*: one machine
//! word per direct-jump slot, rewritten when the block is chained to a
//! successor. Keeping the patch targets out-of-band gives the patcher a
//! writable alias that is distinct from the immutable, executable view
//! ([`ExecView`]), so no raw pointer writes into executable memory ever
//! happen and patching does not serialize execution.
//!
//! Every patch is published with a sequentially consistent fence before the
//! caller releases the target block's jump lock; this stands in for the
//! instruction-cache flush a hardware backend performs, and guarantees no
//! thread can execute through a half-visible patch.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Exit-word encoding for "return to the dispatch loop".
///
/// A freshly generated block exits through the dispatcher; chaining replaces
/// this with the successor's entry encoding, and unlinking restores it.
pub const EXIT_TO_DISPATCH: usize = usize::MAX;

/// Handle to a block of generated host code.
///
/// Handles are never reused: a full cache flush invalidates all outstanding
/// handles but later allocations still receive fresh indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostBlockId(u32);

impl HostBlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Error)]
pub enum CodeArenaError {
    /// The arena hit its block budget. The engine responds by flushing the
    /// whole TB cache and retrying the compilation once.
    #[error("code arena exhausted ({live} live blocks)")]
    Exhausted { live: usize },
}

#[derive(Debug)]
struct HostBlock {
    /// Patchable exit words, one per jump slot emitted by the generator.
    words: Box<[AtomicUsize]>,
}

/// Arena of generated host-code blocks.
///
/// Blocks are reference counted: a flush drops the arena's references, but
/// any thread still executing through an [`ExecView`] keeps its block alive,
/// so code memory is never reused while reachable.
#[derive(Debug)]
pub struct CodeArena {
    blocks: RwLock<Vec<Option<Arc<HostBlock>>>>,
    max_live: usize,
}

impl CodeArena {
    /// `max_live` bounds how many blocks may be live at once; it models the
    /// finite code buffer of a real translator.
    pub fn new(max_live: usize) -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            max_live,
        }
    }

    /// Registers a newly generated block with `exit_words` patchable exit
    /// slots, all initialized to [`EXIT_TO_DISPATCH`].
    pub fn alloc(&self, exit_words: usize) -> Result<HostBlockId, CodeArenaError> {
        let mut blocks = self.blocks.write().unwrap();
        let live = blocks.iter().filter(|b| b.is_some()).count();
        if live >= self.max_live {
            return Err(CodeArenaError::Exhausted { live });
        }
        let words = (0..exit_words)
            .map(|_| AtomicUsize::new(EXIT_TO_DISPATCH))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let id = HostBlockId(u32::try_from(blocks.len()).expect("arena index overflow"));
        blocks.push(Some(Arc::new(HostBlock { words })));
        Ok(id)
    }

    /// Immutable, executable view of a block.
    ///
    /// Returns `None` when the handle was invalidated by a flush: a block
    /// can be dropped between a cache lookup and entry, and the dispatcher
    /// reacts by looking the guest state up again.
    pub fn exec_view(&self, id: HostBlockId) -> Option<ExecView> {
        let blocks = self.blocks.read().unwrap();
        let block = blocks.get(id.index())?.clone()?;
        Some(ExecView { block })
    }

    /// Audited patch operation: rewrites one exit word.
    ///
    /// Callers must hold the *target* TB's jump lock across the patch (see
    /// `link::add_jump`); the trailing fence publishes the new word before
    /// that lock is released. A block dropped by a concurrent flush is left
    /// alone: the flush already restored every word it dropped.
    pub fn patch(&self, id: HostBlockId, word: u32, value: usize) {
        let block = {
            let blocks = self.blocks.read().unwrap();
            blocks.get(id.index()).and_then(|b| b.clone())
        };
        let Some(block) = block else { return };
        block.words[word as usize].store(value, Ordering::Release);
        // Stand-in for flush_idcache_range(): the patched word must be
        // globally visible before any thread can execute through the slot.
        fence(Ordering::SeqCst);
    }

    /// Drops every block. Outstanding [`ExecView`]s keep their blocks alive
    /// until the executing threads return to the dispatcher.
    pub fn flush(&self) {
        let mut blocks = self.blocks.write().unwrap();
        for slot in blocks.iter_mut() {
            *slot = None;
        }
    }

    /// Number of live blocks.
    pub fn live(&self) -> usize {
        self.blocks
            .read()
            .unwrap()
            .iter()
            .filter(|b| b.is_some())
            .count()
    }
}

/// Read-only executable alias of a host block, valid for the duration of one
/// execution even across a concurrent flush.
#[derive(Debug, Clone)]
pub struct ExecView {
    block: Arc<HostBlock>,
}

impl ExecView {
    /// Reads one exit word. Pairs with the release store in
    /// [`CodeArena::patch`].
    #[inline]
    pub fn exit_word(&self, word: u32) -> usize {
        self.block.words[word as usize].load(Ordering::Acquire)
    }

    /// Number of patchable exit words in this block.
    #[inline]
    pub fn exit_words(&self) -> usize {
        self.block.words.len()
    }
}
