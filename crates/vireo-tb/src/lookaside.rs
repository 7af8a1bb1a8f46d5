//! Per-CPU direct-mapped TB lookaside.
//!
//! Probed before the shared index on every dispatch. Entries store only a
//! `TbId`; the prober re-checks the block's full identity key and validity
//! after resolving the id, so a stale entry can mis-predict but never
//! mis-execute. One lookaside per CPU, but writers on other CPUs clear
//! entries remotely during invalidation, hence the atomic cells.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::block::TbId;

const LOOKASIDE_BITS: u32 = 10;
const LOOKASIDE_SIZE: usize = 1 << LOOKASIDE_BITS;
const EMPTY: u32 = u32::MAX;

#[inline]
fn bucket(pc: u64) -> usize {
    // Fibonacci hashing spreads the low bits of dense pc sequences.
    let h = pc.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> (64 - LOOKASIDE_BITS)) as usize
}

pub struct Lookaside {
    entries: Box<[AtomicU32; LOOKASIDE_SIZE]>,
}

impl Default for Lookaside {
    fn default() -> Self {
        Self::new()
    }
}

impl Lookaside {
    pub fn new() -> Self {
        let entries = (0..LOOKASIDE_SIZE)
            .map(|_| AtomicU32::new(EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let entries = entries.try_into().unwrap_or_else(|_| unreachable!());
        Self { entries }
    }

    /// Candidate block for `pc`. The caller must validate the hit against
    /// the full identity key before using it.
    #[inline]
    pub fn probe(&self, pc: u64) -> Option<TbId> {
        let bits = self.entries[bucket(pc)].load(Ordering::Acquire);
        if bits == EMPTY {
            return None;
        }
        TbId::from_bits(bits)
    }

    /// Records `id` as the latest block dispatched for `pc`, displacing
    /// whatever shared the bucket.
    #[inline]
    pub fn insert(&self, pc: u64, id: TbId) {
        self.entries[bucket(pc)].store(id.bits(), Ordering::Release);
    }

    /// Drops the entry for `pc` if it still names `id`. Called remotely when
    /// a block is invalidated.
    pub fn evict(&self, pc: u64, id: TbId) {
        let _ = self.entries[bucket(pc)].compare_exchange(
            id.bits(),
            EMPTY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Drops every entry. Called on every CPU after a full cache flush.
    pub fn clear(&self) {
        for e in self.entries.iter() {
            e.store(EMPTY, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Lookaside {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookaside").finish_non_exhaustive()
    }
}
