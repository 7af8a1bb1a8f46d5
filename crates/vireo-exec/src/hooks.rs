//! Trait seams between the engine and its collaborators.
//!
//! The engine knows nothing about the guest architecture, the guest memory
//! layout, or how host code is produced and entered. Those concerns sit
//! behind four traits: [`Target`] (architecture hooks), [`AddressSpace`]
//! (code-page resolution), [`CodeGenerator`] (block compilation) and
//! [`ExecBackend`] (entering generated code).

use std::sync::Arc;

use thiserror::Error;
use vireo_tb::{
    CodeArena, CompileFlags, ExecView, HostBlockId, TbCache, TranslationBlock, TB_JUMP_SLOTS,
};

use crate::cpu::{CpuSignals, InterruptSet, NonLocalExit};

/// The part of the architectural state that forms a block's identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbCpuState {
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u32,
}

/// Architecture hooks.
///
/// The implementation owns the meaning of `Cpu`; the engine only moves it
/// between hooks. Hooks that take `&mut Cpu` run on the owning thread.
pub trait Target: Send + Sync {
    type Cpu;

    /// The identity key of the block starting at the current guest state.
    fn tb_cpu_state(&self, cpu: &Self::Cpu) -> TbCpuState;

    fn set_pc(&self, cpu: &mut Self::Cpu, pc: u64);

    /// Restores guest state from a block whose execution never started.
    /// Targets with derived state beyond the program counter override this.
    fn synchronize_from_tb(&self, cpu: &mut Self::Cpu, tb: &TranslationBlock) {
        self.set_pc(cpu, tb.pc);
    }

    /// Delivers a guest-visible exception. Runs under the engine's
    /// interrupt-delivery lock.
    fn deliver_exception(&self, cpu: &mut Self::Cpu, vector: u32);

    /// Offers the pending interrupt lines to the architecture. Returns the
    /// subset the architecture accepted and delivered; an empty set means
    /// nothing was deliverable (masked). Runs under the interrupt-delivery
    /// lock.
    fn exec_interrupt(&self, cpu: &mut Self::Cpu, pending: InterruptSet) -> InterruptSet;

    /// Whether a halted CPU has work and should wake. The default wakes on
    /// a raised hardware interrupt line.
    fn has_work(&self, _cpu: &Self::Cpu, pending: InterruptSet) -> bool {
        pending.contains(InterruptSet::HARD)
    }

    /// Re-evaluates the interrupt controller while the CPU is halted, before
    /// the `has_work` decision. Runs under the interrupt-delivery lock.
    fn poll_interrupts(&self, _cpu: &mut Self::Cpu, _signals: &CpuSignals) {}

    fn cpu_reset(&self, cpu: &mut Self::Cpu);

    /// Runs just before a debug stop is reported, while guest state is
    /// still consistent.
    fn debug_excp_handler(&self, _cpu: &mut Self::Cpu) {}

    /// The exception vector for a failed code fetch at `pc`.
    fn translation_fault(&self, cpu: &Self::Cpu, pc: u64) -> u32;

    fn cpu_exec_enter(&self, _cpu: &mut Self::Cpu) {}
    fn cpu_exec_exit(&self, _cpu: &mut Self::Cpu) {}
}

/// Resolves guest code pages to their backing (physical) pages.
pub trait AddressSpace: Send + Sync {
    /// Backing page of the guest page at `vaddr_page`, or `None` when the
    /// fetch would fault under the current mapping.
    fn code_page(&self, vaddr_page: u64) -> Option<u64>;
}

/// One compilation request, fully naming the block to produce.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest {
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u32,
    /// Compile-time variant selection; a non-zero count field requests a
    /// block of exactly that many instructions.
    pub cflags: CompileFlags,
    pub phys_page0: u64,
}

/// What the generator hands back for a compiled block.
#[derive(Debug, Clone)]
pub struct TbArtifact {
    pub code: HostBlockId,
    /// Guest instructions compiled into the block.
    pub icount: u16,
    /// Set when the block reads code past its first page boundary.
    pub second_page: Option<u64>,
    /// Exit-word index per jump slot; `None` disables direct chaining on
    /// that edge.
    pub jump_slots: [Option<u32>; TB_JUMP_SLOTS],
}

#[derive(Debug, Error)]
pub enum CompileError {
    /// The code arena is full. The engine flushes the whole translation
    /// cache and retries once.
    #[error("code arena exhausted")]
    Exhausted,
    /// The guest faulted while its code was being read.
    #[error("guest fault (vector {vector}) during code fetch")]
    GuestFault { vector: u32 },
}

/// The block compiler. The engine's generation lock owns the generator, so
/// `compile` never runs concurrently with itself.
pub trait CodeGenerator: Send {
    type Cpu;

    fn compile(
        &mut self,
        cpu: &Self::Cpu,
        req: &CompileRequest,
        arena: &CodeArena,
    ) -> Result<TbArtifact, CompileError>;
}

/// Which exit a block (or chain of blocks) took back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbExit {
    /// The block ran to completion and left through jump slot `0` or `1`
    /// without a chained successor; the dispatcher may chain it.
    Slot(usize),
    /// The block's prologue observed the exit sentinel (or an exhausted
    /// budget) and returned without executing.
    Requested,
}

/// Result of entering generated code.
#[derive(Debug, Clone)]
pub struct BlockRun {
    /// The last block control reached. With chaining this may be several
    /// hops past the entry block; on [`TbExit::Requested`] it is the block
    /// that was *about* to execute.
    pub last_tb: Arc<TranslationBlock>,
    pub exit: TbExit,
}

/// Read-only engine state a backend needs to follow chained exits.
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub cache: &'a TbCache,
    pub arena: &'a CodeArena,
}

/// Enters generated host code.
///
/// Contract, mirroring what real generated prologues do:
/// - before executing each block, test the decrementer: blocks compiled
///   with `USE_ICOUNT` retire their instruction count via
///   `IcountDecr::consume`, all others just sign-test `whole()`; on
///   failure return [`TbExit::Requested`] with that block as `last_tb`;
/// - after a block body, read its exit word through `code` ([`ExecView`]);
///   a word other than `EXIT_TO_DISPATCH` names the chained successor to
///   enter next. A successor that no longer resolves, is invalid, or whose
///   code was dropped by a racing flush returns to the dispatcher instead.
pub trait ExecBackend: Send + Sync {
    type Cpu;

    fn execute(
        &self,
        cpu: &mut Self::Cpu,
        signals: &CpuSignals,
        ctx: ExecContext<'_>,
        entry: Arc<TranslationBlock>,
        code: &ExecView,
    ) -> Result<BlockRun, NonLocalExit>;
}
