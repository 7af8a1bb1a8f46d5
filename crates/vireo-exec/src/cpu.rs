//! Per-CPU execution state.
//!
//! State is split by ownership. [`CpuSignals`] is the `Arc`-shared,
//! thread-safe slice that other threads poke to interrupt or stop a CPU;
//! [`VCpu`] is the thread-owned remainder (architectural state, halt flag,
//! pending-exception classification, instruction budget). The split keeps
//! every cross-thread write behind an atomic and everything else free of
//! synchronization.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use vireo_tb::{CompileFlags, Lookaside};

bitflags! {
    /// Pending-interrupt mask, one bit per asynchronous event class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptSet: u32 {
        /// External hardware interrupt line.
        const HARD = 1 << 1;
        /// Program flow changed behind the engine's back; break chaining.
        const EXITTB = 1 << 2;
        /// Park the CPU.
        const HALT = 1 << 5;
        /// Debugger stop request.
        const DEBUG = 1 << 7;
        /// Full CPU reset.
        const RESET = 1 << 10;
        /// Re-evaluate the interrupt controller before deciding the CPU
        /// has no work. Consumed by the wakeup check, never delivered.
        const POLL = 1 << 13;
    }
}

/// The instruction-count decrementer: one `u32`, two roles.
///
/// The low half holds the remaining instruction budget of the current
/// deterministic-execution quantum; generated code retires each block's
/// instruction count against it. The high half is an exit sentinel: setting
/// it drives the whole word negative (as `i32`), which the block prologue
/// tests with a single sign check. One load in the hot path covers both.
#[derive(Debug, Default)]
pub struct IcountDecr(AtomicU32);

impl IcountDecr {
    const HIGH_MASK: u32 = 0xffff_0000;
    const LOW_MASK: u32 = 0x0000_ffff;

    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining budget in the current quantum.
    #[inline]
    pub fn low(&self) -> u16 {
        (self.0.load(Ordering::Acquire) & Self::LOW_MASK) as u16
    }

    /// The whole word as a sign-testable value; negative when an exit has
    /// been requested.
    #[inline]
    pub fn whole(&self) -> i32 {
        self.0.load(Ordering::Acquire) as i32
    }

    /// Installs a fresh quantum budget, preserving a concurrently raised
    /// exit sentinel.
    pub fn set_budget(&self, insns: u16) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = (cur & Self::HIGH_MASK) | u32::from(insns);
            match self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Raises the exit sentinel: the owning CPU leaves generated code at
    /// the next block boundary.
    #[inline]
    pub fn request_exit(&self) {
        self.0.fetch_or(Self::HIGH_MASK, Ordering::SeqCst);
    }

    /// Clears the exit sentinel. Sequentially consistent: the clear must
    /// order before the subsequent reads of the interrupt and exit flags,
    /// so a request that lands after the clear re-raises a sentinel the
    /// next block prologue will see.
    #[inline]
    pub fn clear_high(&self) {
        self.0.fetch_and(Self::LOW_MASK, Ordering::SeqCst);
    }

    /// Block-prologue budget check: retires `insns` against the budget.
    ///
    /// Returns `false`, without committing the decrement, when the budget
    /// is insufficient or the exit sentinel is raised; the block must then
    /// return to the dispatcher instead of executing.
    pub fn consume(&self, insns: u16) -> bool {
        let mut cur = self.0.load(Ordering::SeqCst);
        loop {
            let left = (cur as i32) - i32::from(insns);
            if left < 0 {
                return false;
            }
            // Only the low half is rewritten, so a sentinel raised between
            // the load and the store survives via the retry.
            let new = (cur & Self::HIGH_MASK) | (left as u32 & Self::LOW_MASK);
            match self
                .0
                .compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }
}

/// The shared, thread-safe slice of a CPU.
///
/// Held behind an `Arc` by the owning thread, the engine's CPU registry and
/// any device code that needs to interrupt the CPU.
#[derive(Debug)]
pub struct CpuSignals {
    index: usize,
    icount_decr: IcountDecr,
    interrupt_request: AtomicU32,
    exit_request: AtomicBool,
    lookaside: Lookaside,
}

impl CpuSignals {
    pub fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            icount_decr: IcountDecr::new(),
            interrupt_request: AtomicU32::new(0),
            exit_request: AtomicBool::new(false),
            lookaside: Lookaside::new(),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn icount_decr(&self) -> &IcountDecr {
        &self.icount_decr
    }

    #[inline]
    pub fn lookaside(&self) -> &Lookaside {
        &self.lookaside
    }

    /// Raises interrupt lines and kicks the CPU out of generated code so it
    /// notices them at the next block boundary. Does not force the CPU out
    /// of its dispatch loop.
    pub fn request_interrupt(&self, set: InterruptSet) {
        self.interrupt_request.fetch_or(set.bits(), Ordering::SeqCst);
        self.icount_decr.request_exit();
    }

    /// Asks the CPU to leave its dispatch loop entirely and return control
    /// to the caller of `Engine::run`.
    pub fn request_exit(&self) {
        self.exit_request.store(true, Ordering::SeqCst);
        self.icount_decr.request_exit();
    }

    #[inline]
    pub fn pending_interrupts(&self) -> InterruptSet {
        InterruptSet::from_bits_truncate(self.interrupt_request.load(Ordering::SeqCst))
    }

    pub fn clear_interrupt(&self, set: InterruptSet) {
        self.interrupt_request.fetch_and(!set.bits(), Ordering::SeqCst);
    }

    /// Consumes the exit request, if raised. At most one caller observes
    /// `true` per request.
    pub fn take_exit_request(&self) -> bool {
        self.exit_request.swap(false, Ordering::SeqCst)
    }
}

/// How a CPU left its dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// An exit request or budget exhaustion handed control back; re-enter
    /// `run` to continue.
    Interrupt,
    /// The CPU is parked until an interrupt gives it work.
    Halted,
    /// A debug event stopped the CPU for the debugger's attention.
    Debug,
    /// The CPU was reset.
    Reset,
}

/// What the next iteration of the dispatch loop must process before any
/// more guest code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingExcp {
    /// A guest-visible exception to deliver through the target hook.
    Guest(u32),
    /// Leave the dispatch loop with this status.
    Stop(ExitStatus),
}

/// A non-local exit from inside generated code or the lookup path,
/// propagated as an `Err` so every intermediate layer releases its state
/// through ordinary drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonLocalExit {
    /// Re-enter the dispatch loop with `pending` set.
    Exception(PendingExcp),
    /// The current instruction needs the whole machine stopped; re-execute
    /// it alone inside the exclusive region.
    AtomicStep,
}

/// Thread-owned per-CPU state.
///
/// `C` is the target's architectural state; this type only carries what the
/// dispatch loop itself needs.
#[derive(Debug)]
pub struct VCpu<C> {
    index: usize,
    pub arch: C,
    signals: Arc<CpuSignals>,
    pub(crate) halted: bool,
    pub(crate) singlestep: bool,
    pub(crate) pending: Option<PendingExcp>,
    /// Compile-flags override for the next block only; set when the
    /// remaining budget forces an exact-count block.
    pub(crate) cflags_next_tb: Option<CompileFlags>,
    /// Quantum instructions not yet loaded into the 16-bit decrementer.
    pub(crate) icount_extra: u64,
    /// Whole remaining quantum (decrementer low half plus `icount_extra`).
    pub(crate) icount_budget: u64,
}

impl<C> VCpu<C> {
    pub fn new(index: usize, arch: C) -> Self {
        Self {
            index,
            arch,
            signals: CpuSignals::new(index),
            halted: false,
            singlestep: false,
            pending: None,
            cflags_next_tb: None,
            icount_extra: 0,
            icount_budget: 0,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn signals(&self) -> &Arc<CpuSignals> {
        &self.signals
    }

    #[inline]
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    pub fn set_singlestep(&mut self, enabled: bool) {
        self.singlestep = enabled;
    }

    /// Queues a guest-visible exception for delivery before any further
    /// guest code runs.
    pub fn raise_exception(&mut self, vector: u32) {
        self.pending = Some(PendingExcp::Guest(vector));
    }
}
