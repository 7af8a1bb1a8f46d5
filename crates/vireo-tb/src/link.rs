//! The jump patch manager.
//!
//! Chaining rewrites a block's exit word so it enters its successor
//! directly, bypassing the dispatch loop. The protocol, in order:
//!
//! 1. take the *target*'s jump lock (its incoming-patch mutex);
//! 2. re-check the target's validity under that lock; a concurrently
//!    invalidated target abandons the claim with no code mutation;
//! 3. claim the source slot with a compare-and-set (first patcher wins);
//! 4. patch the exit word through the arena's audited operation, which
//!    publishes the word before the lock is released;
//! 5. record the `{source, slot}` edge in the target's incoming list.
//!
//! Unlinking reverses the patch under the same lock. When the lock cannot
//! be taken immediately, the slot is flagged and the restore is applied at
//! the owner's next safe point ([`apply_deferred_unlinks`]).

use std::sync::Arc;

use tracing::trace;

use crate::arena::{CodeArena, EXIT_TO_DISPATCH};
use crate::block::{IncomingEdge, TranslationBlock, TB_JUMP_SLOTS};
use crate::cache::TbCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The slot was claimed and the host code patched.
    Linked,
    /// Another patcher already claimed the slot; no code was touched.
    AlreadyLinked,
    /// The target was invalidated before the claim; no code was touched.
    TargetInvalid,
    /// The generator emitted no direct branch for this edge.
    NoDirectSlot,
}

/// Chains `from`'s `slot`-th exit into `to`.
pub fn add_jump(
    arena: &CodeArena,
    from: &Arc<TranslationBlock>,
    slot: usize,
    to: &Arc<TranslationBlock>,
) -> LinkOutcome {
    assert!(slot < TB_JUMP_SLOTS);
    let Some(reset_word) = from.jump_reset_word(slot) else {
        return LinkOutcome::NoDirectSlot;
    };

    let mut incoming = to.incoming().lock().unwrap();
    if !to.is_valid() {
        return LinkOutcome::TargetInvalid;
    }
    if !from.claim_jump(slot, to.id()) {
        return LinkOutcome::AlreadyLinked;
    }
    // Any unlink signal still pending on this slot belonged to the previous
    // link and has already been carried out.
    from.take_unlink_signal(slot);

    arena.patch(from.code, reset_word, to.id().bits() as usize);
    incoming.push(IncomingEdge {
        from: from.id(),
        slot,
    });
    drop(incoming);

    trace!(
        from = format_args!("{:#x}", from.pc),
        slot,
        to = format_args!("{:#x}", to.pc),
        "linked tbs",
    );
    LinkOutcome::Linked
}

/// Restores `from`'s `slot` to the dispatch-returning exit and clears the
/// destination. Caller holds the old target's jump lock (or the target is
/// already unreachable).
fn restore_slot(arena: &CodeArena, from: &TranslationBlock, slot: usize) {
    if let Some(reset_word) = from.jump_reset_word(slot) {
        arena.patch(from.code, reset_word, EXIT_TO_DISPATCH);
    }
    from.clear_jump(slot);
}

/// Explicitly unlinks `from`'s `slot`-th exit.
///
/// Returns `true` when the restore was applied immediately. If the target's
/// jump lock is contended the slot is only flagged, and the restore happens
/// at the owner's next safe point; callers that need the unlink to be
/// visible synchronously must not rely on a `false` return.
pub fn unlink(cache: &TbCache, arena: &CodeArena, from: &Arc<TranslationBlock>, slot: usize) -> bool {
    let Some(dest) = from.jump_dest(slot) else {
        return true;
    };
    let Some(target) = cache.get(dest) else {
        // Target already dropped (flush); nothing to splice out of.
        restore_slot(arena, from, slot);
        return true;
    };
    let applied = match target.incoming().try_lock() {
        Ok(mut edges) => {
            edges.retain(|e| !(e.from == from.id() && e.slot == slot));
            restore_slot(arena, from, slot);
            true
        }
        Err(_) => {
            from.signal_unlink(slot);
            false
        }
    };
    applied
}

/// Applies any deferred unlink signals on `tb`. Called by the dispatch loop
/// right after `tb` finishes executing, a safe point where blocking on the
/// target's jump lock is allowed.
pub fn apply_deferred_unlinks(cache: &TbCache, arena: &CodeArena, tb: &Arc<TranslationBlock>) {
    for slot in 0..TB_JUMP_SLOTS {
        if !tb.take_unlink_signal(slot) {
            continue;
        }
        let Some(dest) = tb.jump_dest(slot) else {
            continue;
        };
        if let Some(target) = cache.get(dest) {
            let mut edges = target.incoming().lock().unwrap();
            edges.retain(|e| !(e.from == tb.id() && e.slot == slot));
            restore_slot(arena, tb, slot);
        } else {
            restore_slot(arena, tb, slot);
        }
    }
}

/// Restores every caller chained into `target`. Part of invalidation: after
/// this returns, no patched exit word reaches `target` any more.
pub(crate) fn unlink_all_incoming(
    cache: &TbCache,
    arena: &CodeArena,
    target: &Arc<TranslationBlock>,
) {
    let mut edges = target.incoming().lock().unwrap();
    for edge in edges.drain(..) {
        let Some(src) = cache.get(edge.from) else {
            continue;
        };
        // The source may have been re-pointed or unlinked concurrently;
        // only restore a slot that still targets us.
        if src.jump_dest(edge.slot) == Some(target.id()) {
            restore_slot(arena, &src, edge.slot);
        }
    }
}

/// Restores every patched exit word of `tb` to the dispatch-returning
/// exit. Part of a full flush: a thread still executing `tb` through an
/// outstanding view must fall back to the dispatcher instead of chaining
/// into a block that no longer resolves.
pub(crate) fn reset_outgoing_jumps(arena: &CodeArena, tb: &TranslationBlock) {
    for slot in 0..TB_JUMP_SLOTS {
        if tb.jump_dest(slot).is_some() {
            restore_slot(arena, tb, slot);
        }
    }
}

/// Removes `tb`'s own outgoing edges from its successors' incoming lists.
/// Part of invalidation: `tb` will never execute again, so its exit words
/// are left as they are.
pub(crate) fn sever_outgoing(cache: &TbCache, tb: &Arc<TranslationBlock>) {
    for slot in 0..TB_JUMP_SLOTS {
        let Some(dest) = tb.jump_dest(slot) else {
            continue;
        };
        if let Some(target) = cache.get(dest) {
            let mut edges = target.incoming().lock().unwrap();
            edges.retain(|e| !(e.from == tb.id() && e.slot == slot));
        }
        tb.clear_jump(slot);
    }
}
