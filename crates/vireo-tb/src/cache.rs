//! The shared translation-block index.
//!
//! Blocks are stored in an append-only arena (`TbId` -> block) alongside two
//! maps: the identity index used by dispatch lookups, and a page map used to
//! find every block reading code from a guest page when that page is
//! overwritten.
//!
//! Lookups only take reader locks. Structural changes (insert, invalidate,
//! flush) take writer locks and are additionally serialized by the engine's
//! generation lock, so the interior locking only has to protect readers
//! against torn views, never writer/writer races.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::arena::CodeArena;
use crate::block::{CompileFlags, TbDesc, TbId, TranslationBlock};
use crate::{link, page_of};

/// Full identity key of a translation block.
///
/// `phys_page0` is the backing page of `pc` under the *current* mapping;
/// including it makes a lookup a pure function of the mapping, so a block
/// compiled under a stale mapping can never be returned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TbKey {
    pub phys_page0: u64,
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u32,
    pub cflags: CompileFlags,
}

impl TbKey {
    fn of(tb: &TranslationBlock) -> Option<Self> {
        Some(Self {
            phys_page0: tb.page_addr[0]?,
            pc: tb.pc,
            cs_base: tb.cs_base,
            flags: tb.flags,
            cflags: tb.cflags,
        })
    }
}

#[derive(Debug, Default)]
pub struct TbCache {
    /// `TbId` -> block; slots are cleared on invalidation/flush and ids are
    /// never reused.
    tbs: RwLock<Vec<Option<Arc<TranslationBlock>>>>,
    index: RwLock<HashMap<TbKey, Vec<TbId>>>,
    pages: RwLock<HashMap<u64, Vec<TbId>>>,
}

impl TbCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves an id to a live block. Stale ids (invalidated or flushed)
    /// return `None`.
    pub fn get(&self, id: TbId) -> Option<Arc<TranslationBlock>> {
        self.tbs.read().unwrap().get(id.index())?.clone()
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.tbs.read().unwrap().iter().filter(|t| t.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a freshly generated block and returns it. Caller holds the
    /// generation lock.
    pub fn insert(&self, desc: TbDesc) -> Arc<TranslationBlock> {
        let mut tbs = self.tbs.write().unwrap();
        let id = TbId::new(u32::try_from(tbs.len()).expect("tb index overflow"));
        let tb = Arc::new(TranslationBlock::new(id, desc));
        tbs.push(Some(tb.clone()));
        drop(tbs);

        if let Some(key) = TbKey::of(&tb) {
            self.index.write().unwrap().entry(key).or_default().push(id);
        }
        let mut pages = self.pages.write().unwrap();
        for page in tb.page_addr.iter().flatten() {
            pages.entry(*page).or_default().push(id);
        }
        tb
    }

    /// Looks up a block by identity key.
    ///
    /// A block spanning two guest pages additionally requires its second
    /// backing page to match the current mapping; `resolve` translates a
    /// guest page address to its backing page (returning `None` on a
    /// translation fault, which simply fails the match).
    pub fn lookup(
        &self,
        key: &TbKey,
        mut resolve: impl FnMut(u64) -> Option<u64>,
    ) -> Option<Arc<TranslationBlock>> {
        let candidates = {
            let index = self.index.read().unwrap();
            index.get(key)?.clone()
        };
        for id in candidates {
            let Some(tb) = self.get(id) else { continue };
            if !tb.is_valid() {
                continue;
            }
            match tb.page_addr[1] {
                None => return Some(tb),
                Some(page1) => {
                    // The block spills into the next guest page; its mapping
                    // may have changed independently of page 0.
                    let virt_page1 = crate::next_page(tb.pc);
                    if resolve(virt_page1).map(page_of) == Some(page1) {
                        return Some(tb);
                    }
                }
            }
        }
        None
    }

    /// Invalidates one block: no thread can look it up afterwards, and every
    /// caller chained into it is restored to the dispatch-returning exit.
    pub fn invalidate(&self, arena: &CodeArena, tb: &Arc<TranslationBlock>) {
        // Order matters: the validity flag stops new chaining (add_jump
        // checks it under the jump lock) before we unlink existing callers.
        tb.set_invalid();

        if let Some(key) = TbKey::of(tb) {
            let mut index = self.index.write().unwrap();
            if let Some(bucket) = index.get_mut(&key) {
                bucket.retain(|id| *id != tb.id());
                if bucket.is_empty() {
                    index.remove(&key);
                }
            }
        }
        {
            let mut pages = self.pages.write().unwrap();
            for page in tb.page_addr.iter().flatten() {
                if let Some(bucket) = pages.get_mut(page) {
                    bucket.retain(|id| *id != tb.id());
                    if bucket.is_empty() {
                        pages.remove(page);
                    }
                }
            }
        }

        link::unlink_all_incoming(self, arena, tb);
        link::sever_outgoing(self, tb);

        let mut tbs = self.tbs.write().unwrap();
        tbs[tb.id().index()] = None;
    }

    /// Invalidates every block reading code from `page`. Returns how many
    /// blocks were dropped.
    pub fn invalidate_page(&self, arena: &CodeArena, page: u64) -> usize {
        let ids = {
            let pages = self.pages.read().unwrap();
            pages.get(&page_of(page)).cloned().unwrap_or_default()
        };
        let mut dropped = 0;
        for id in ids {
            if let Some(tb) = self.get(id) {
                self.invalidate(arena, &tb);
                dropped += 1;
            }
        }
        dropped
    }

    /// Drops every block and every host-code block. Caller holds the
    /// generation lock; per-CPU lookasides must be cleared by the caller.
    ///
    /// CPUs still inside generated code are not waited for: their
    /// outstanding exec views keep the host code alive, and every patched
    /// exit word is restored before the drop, so an in-flight chain falls
    /// back to the dispatcher instead of following a dangling id.
    pub fn flush(&self, arena: &CodeArena) {
        let mut tbs = self.tbs.write().unwrap();
        let mut live = 0;
        for slot in tbs.iter_mut() {
            if let Some(tb) = slot.take() {
                tb.set_invalid();
                link::reset_outgoing_jumps(arena, &tb);
                tb.incoming().lock().unwrap().clear();
                live += 1;
            }
        }
        self.index.write().unwrap().clear();
        self.pages.write().unwrap().clear();
        arena.flush();
        debug!(blocks = live, "tb cache flushed");
    }
}
