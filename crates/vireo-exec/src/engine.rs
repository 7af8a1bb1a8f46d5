//! The execution engine and its dispatch loop.
//!
//! [`Engine`] owns every piece of cross-CPU state: the translation cache
//! and code arena, the generation lock, the interrupt-delivery lock, the
//! exclusive-execution coordinator and the clock configuration. Nothing is
//! process-global; tests and embedders construct as many engines as they
//! like.
//!
//! [`Engine::run`] is the per-CPU dispatch loop. Its shape, outermost in:
//!
//! - halted CPUs are parked (or woken) before anything else;
//! - an outer loop delivers whatever exception is pending, then
//! - an inner loop polls interrupt and exit requests at every block
//!   boundary, finds (or compiles) the next block, executes it, and chains
//!   it to its predecessor when control arrived through a direct-jump
//!   slot.
//!
//! Non-local exits from generated code propagate as `Err` values up
//! through these loops; every lock and region membership is released by
//! guard drops along the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, trace};
use vireo_tb::{
    link, next_page, page_of, CodeArena, CompileFlags, TbCache, TbDesc, TbKey, TranslationBlock,
};

use crate::cpu::{CpuSignals, ExitStatus, InterruptSet, NonLocalExit, PendingExcp, VCpu};
use crate::exclusive::ExclusiveCoordinator;
use crate::hooks::{
    AddressSpace, BlockRun, CodeGenerator, CompileError, CompileRequest, ExecBackend, ExecContext,
    Target, TbExit,
};
use crate::icount::{DriftInfo, DriftStats, IcountMode, SyncClocks};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Compilation still failed after a full translation-cache flush; the
    /// arena cannot hold even the working set of one block.
    #[error("code arena exhausted after a full translation cache flush")]
    CodeArenaExhausted,
}

pub struct EngineConfig {
    /// Bound on live host-code blocks in the arena.
    pub max_code_blocks: usize,
    pub icount: Option<IcountMode>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_code_blocks: 4096,
            icount: None,
        }
    }
}

/// Error plumbing internal to the dispatch loop: either a non-local exit
/// to re-enter the loop with, or a fatal engine error to surface.
enum DispatchErr {
    NonLocal(NonLocalExit),
    Fatal(EngineError),
}

impl From<NonLocalExit> for DispatchErr {
    fn from(nl: NonLocalExit) -> Self {
        Self::NonLocal(nl)
    }
}

/// The previous block and the jump slot it left through, i.e. the edge a
/// successful lookup will chain. `None` whenever control flow was redirected
/// (interrupt delivered, exit requested, EXITTB).
type Chain = Option<(Arc<TranslationBlock>, usize)>;

pub struct Engine<T: Target, B, G, A> {
    target: T,
    backend: B,
    /// The lock is ownership of the generator: holding it serializes
    /// compilation and every structural cache change.
    generator: Mutex<G>,
    mem: A,
    cache: TbCache,
    arena: CodeArena,
    exclusive: ExclusiveCoordinator,
    /// Coarse lock held around interrupt and exception delivery hooks.
    io_lock: Mutex<()>,
    icount: Option<IcountMode>,
    drift: DriftStats,
    /// More than one CPU is registered; freshly compiled blocks must honor
    /// guest atomics.
    parallel: AtomicBool,
    cpus: RwLock<Vec<Arc<CpuSignals>>>,
}

impl<T, B, G, A> Engine<T, B, G, A>
where
    T: Target,
    B: ExecBackend<Cpu = T::Cpu>,
    G: CodeGenerator<Cpu = T::Cpu>,
    A: AddressSpace,
{
    pub fn new(config: EngineConfig, target: T, backend: B, generator: G, mem: A) -> Self {
        Self {
            target,
            backend,
            generator: Mutex::new(generator),
            mem,
            cache: TbCache::new(),
            arena: CodeArena::new(config.max_code_blocks),
            exclusive: ExclusiveCoordinator::new(),
            io_lock: Mutex::new(()),
            icount: config.icount,
            drift: DriftStats::new(),
            parallel: AtomicBool::new(false),
            cpus: RwLock::new(Vec::new()),
        }
    }

    pub fn mem(&self) -> &A {
        &self.mem
    }

    /// Number of live translation blocks.
    pub fn tb_count(&self) -> usize {
        self.cache.len()
    }

    /// Registers a CPU with the engine. Must be called before `run`.
    pub fn register_cpu(&self, cpu: &VCpu<T::Cpu>) {
        let went_parallel = {
            let mut cpus = self.cpus.write().unwrap();
            cpus.push(cpu.signals().clone());
            cpus.len() > 1 && !self.parallel.swap(true, Ordering::SeqCst)
        };
        if went_parallel {
            // Everything compiled so far lacks the PARALLEL variant and
            // must not be reused.
            self.flush_all();
        }
    }

    /// Worst observed guest/host drift, when clock alignment is active.
    pub fn drift_info(&self) -> Option<DriftInfo> {
        self.icount
            .as_ref()
            .filter(|ic| ic.align)
            .map(|_| self.drift.info())
    }

    /// Invalidates one block.
    pub fn invalidate_tb(&self, tb: &Arc<TranslationBlock>) {
        let _gen = self.generator.lock().unwrap();
        self.cache.invalidate(&self.arena, tb);
        for signals in self.cpus.read().unwrap().iter() {
            signals.lookaside().evict(tb.pc, tb.id());
        }
    }

    /// Invalidates every block reading code from the page containing
    /// `addr`. Returns how many blocks were dropped.
    pub fn invalidate_page(&self, addr: u64) -> usize {
        let _gen = self.generator.lock().unwrap();
        self.cache.invalidate_page(&self.arena, addr)
    }

    /// Invalidates every block overlapping `[start, end)`.
    pub fn invalidate_page_range(&self, start: u64, end: u64) -> usize {
        let _gen = self.generator.lock().unwrap();
        let mut dropped = 0;
        let mut page = page_of(start);
        while page < end {
            dropped += self.cache.invalidate_page(&self.arena, page);
            page = next_page(page);
        }
        dropped
    }

    /// Drops every translation block and all generated code.
    pub fn flush_all(&self) {
        let _gen = self.generator.lock().unwrap();
        self.flush_all_locked();
    }

    /// Caller holds the generation lock.
    fn flush_all_locked(&self) {
        self.cache.flush(&self.arena);
        for signals in self.cpus.read().unwrap().iter() {
            signals.lookaside().clear();
        }
    }

    /// Compile-flag variant for blocks entered under the current engine
    /// configuration.
    fn curr_cflags(&self) -> CompileFlags {
        let mut cf = CompileFlags::empty();
        if self.icount.is_some() {
            cf = cf.with_use_icount();
        }
        if self.parallel.load(Ordering::Acquire) {
            cf = cf.with_parallel();
        }
        cf
    }

    /// Runs `cpu` until something hands control back to the caller.
    ///
    /// `Ok` statuses are ordinary stop reasons (interrupt window, halt,
    /// debug, reset); the caller reacts and typically calls `run` again.
    pub fn run(&self, cpu: &mut VCpu<T::Cpu>) -> Result<ExitStatus, EngineError> {
        self.icount_start(cpu);
        let result = loop {
            match self.cpu_exec(cpu) {
                Ok(status) => break Ok(status),
                Err(DispatchErr::Fatal(err)) => break Err(err),
                Err(DispatchErr::NonLocal(NonLocalExit::Exception(pending))) => {
                    cpu.pending = Some(pending);
                }
                Err(DispatchErr::NonLocal(NonLocalExit::AtomicStep)) => {
                    if let Err(err) = self.exec_step_atomic(cpu) {
                        break Err(err);
                    }
                }
            }
        };
        self.icount_finish(cpu);
        result
    }

    fn cpu_exec(&self, cpu: &mut VCpu<T::Cpu>) -> Result<ExitStatus, DispatchErr> {
        if self.handle_halt(cpu) {
            return Ok(ExitStatus::Halted);
        }
        let _run = self.exclusive.begin_run();
        self.target.cpu_exec_enter(&mut cpu.arch);
        let result = self.exec_loop(cpu);
        self.target.cpu_exec_exit(&mut cpu.arch);
        result
    }

    fn exec_loop(&self, cpu: &mut VCpu<T::Cpu>) -> Result<ExitStatus, DispatchErr> {
        let mut clocks = match &self.icount {
            Some(ic) => SyncClocks::start(ic, &self.drift, self.cpu_icount(cpu)),
            None => SyncClocks::disabled(),
        };
        loop {
            if let Some(status) = self.handle_exception(cpu) {
                return Ok(status);
            }
            let mut chain: Chain = None;
            while !self.handle_interrupt(cpu, &mut chain) {
                let cflags = match cpu.cflags_next_tb.take() {
                    Some(cf) => cf,
                    None => self.curr_cflags(),
                };
                self.cpu_loop_exec_tb(cpu, cflags, &mut chain)?;
                if let Some(ic) = &self.icount {
                    clocks.align(ic, self.cpu_icount(cpu));
                }
            }
        }
    }

    /// Parks a halted CPU, or wakes it when it has work. Returns `true`
    /// when the CPU stays parked.
    fn handle_halt(&self, cpu: &mut VCpu<T::Cpu>) -> bool {
        if !cpu.halted {
            return false;
        }
        let signals = cpu.signals().clone();
        if signals.pending_interrupts().contains(InterruptSet::POLL) {
            let _io = self.io_lock.lock().unwrap();
            self.target.poll_interrupts(&mut cpu.arch, &signals);
            signals.clear_interrupt(InterruptSet::POLL);
        }
        if !self.target.has_work(&cpu.arch, signals.pending_interrupts()) {
            return true;
        }
        cpu.halted = false;
        false
    }

    /// Processes whatever the previous iteration classified as pending.
    /// `Some` leaves the dispatch loop with that status.
    fn handle_exception(&self, cpu: &mut VCpu<T::Cpu>) -> Option<ExitStatus> {
        match cpu.pending.take()? {
            PendingExcp::Stop(status) => {
                if status == ExitStatus::Debug {
                    self.target.debug_excp_handler(&mut cpu.arch);
                }
                Some(status)
            }
            PendingExcp::Guest(vector) => {
                {
                    let _io = self.io_lock.lock().unwrap();
                    self.target.deliver_exception(&mut cpu.arch, vector);
                }
                if cpu.singlestep {
                    // The debugger gets control before the handler's first
                    // instruction runs.
                    self.target.debug_excp_handler(&mut cpu.arch);
                    return Some(ExitStatus::Debug);
                }
                None
            }
        }
    }

    /// Block-boundary poll of interrupt and exit requests. Returns `true`
    /// when the inner loop must stop and re-classify via `handle_exception`.
    fn handle_interrupt(&self, cpu: &mut VCpu<T::Cpu>, chain: &mut Chain) -> bool {
        let signals = cpu.signals().clone();
        // The sentinel is cleared strictly before the request flags are
        // read; a request landing after the clear re-raises it and the next
        // block prologue bails out, so no request can sit unnoticed for
        // more than one block.
        signals.icount_decr().clear_high();

        if !signals.pending_interrupts().is_empty() {
            let _io = self.io_lock.lock().unwrap();
            let pending = signals.pending_interrupts();
            if pending.contains(InterruptSet::DEBUG) {
                signals.clear_interrupt(InterruptSet::DEBUG);
                cpu.pending = Some(PendingExcp::Stop(ExitStatus::Debug));
                return true;
            }
            if pending.contains(InterruptSet::HALT) {
                signals.clear_interrupt(InterruptSet::HALT);
                cpu.halted = true;
                cpu.pending = Some(PendingExcp::Stop(ExitStatus::Halted));
                return true;
            }
            if pending.contains(InterruptSet::RESET) {
                signals.clear_interrupt(InterruptSet::RESET);
                self.target.cpu_reset(&mut cpu.arch);
                cpu.pending = Some(PendingExcp::Stop(ExitStatus::Reset));
                return true;
            }
            let offered = pending & (InterruptSet::HARD | InterruptSet::POLL);
            if !offered.is_empty() {
                let accepted = self.target.exec_interrupt(&mut cpu.arch, offered);
                if !accepted.is_empty() {
                    signals.clear_interrupt(accepted);
                    if cpu.singlestep {
                        cpu.pending = Some(PendingExcp::Stop(ExitStatus::Debug));
                        return true;
                    }
                    cpu.pending = None;
                    // Delivery redirected the program flow; the previous
                    // block must not be chained to whatever runs next.
                    *chain = None;
                }
            }
            // The delivery hook itself may have changed the program flow.
            if signals.pending_interrupts().contains(InterruptSet::EXITTB) {
                signals.clear_interrupt(InterruptSet::EXITTB);
                *chain = None;
            }
        }

        let budget_exhausted = self.icount.is_some()
            && cpu.cflags_next_tb.map_or(true, |cf| cf.use_icount())
            && self.cpu_icount(cpu) == 0;
        if signals.take_exit_request() || budget_exhausted {
            if cpu.pending.is_none() {
                cpu.pending = Some(PendingExcp::Stop(ExitStatus::Interrupt));
            }
            return true;
        }
        false
    }

    fn cpu_loop_exec_tb(
        &self,
        cpu: &mut VCpu<T::Cpu>,
        cflags: CompileFlags,
        chain: &mut Chain,
    ) -> Result<(), DispatchErr> {
        let tb = self.tb_find(cpu, cflags, chain)?;
        let Some(run) = self.cpu_exec_tb(cpu, tb)? else {
            // The block was flushed between lookup and entry; go around
            // and look the guest state up again.
            *chain = None;
            return Ok(());
        };
        match run.exit {
            TbExit::Slot(slot) => {
                *chain = Some((run.last_tb, slot));
            }
            TbExit::Requested => {
                *chain = None;
                if cpu.signals().icount_decr().whole() < 0 {
                    // An exit or interrupt request is what stopped us; the
                    // boundary poll picks it up.
                    return Ok(());
                }
                if self.icount.is_some() {
                    self.icount_refill(cpu, &run.last_tb);
                }
            }
        }
        Ok(())
    }

    /// Finds the block for the current guest state, compiling on a miss,
    /// and chains it to the block control arrived from.
    fn tb_find(
        &self,
        cpu: &mut VCpu<T::Cpu>,
        cflags: CompileFlags,
        chain: &mut Chain,
    ) -> Result<Arc<TranslationBlock>, DispatchErr> {
        let st = self.target.tb_cpu_state(&cpu.arch);
        let Some(phys_page0) = self.mem.code_page(page_of(st.pc)) else {
            let vector = self.target.translation_fault(&cpu.arch, st.pc);
            return Err(NonLocalExit::Exception(PendingExcp::Guest(vector)).into());
        };
        let key = TbKey {
            phys_page0: page_of(phys_page0),
            pc: st.pc,
            cs_base: st.cs_base,
            flags: st.flags,
            cflags,
        };
        let signals = cpu.signals().clone();

        let tb = match self.lookaside_probe(&signals, &key) {
            Some(tb) => tb,
            None => {
                let tb = match self.cache.lookup(&key, |vp| self.mem.code_page(vp)) {
                    Some(tb) => tb,
                    None => self.generate(cpu, &key)?,
                };
                signals.lookaside().insert(key.pc, tb.id());
                tb
            }
        };

        if let Some((prev, slot)) = chain.take() {
            // A block spilling into a second page is never chained into:
            // the second page's mapping can change independently. A source
            // invalidated while we were looking up is not worth patching.
            if !tb.spans_two_pages() && prev.is_valid() {
                link::add_jump(&self.arena, &prev, slot, &tb);
            }
        }
        Ok(tb)
    }

    /// Lookaside hits are re-verified against the full identity key (and,
    /// for two-page blocks, the current second-page mapping); a stale entry
    /// can mis-predict but never mis-execute.
    fn lookaside_probe(&self, signals: &CpuSignals, key: &TbKey) -> Option<Arc<TranslationBlock>> {
        let id = signals.lookaside().probe(key.pc)?;
        let tb = self.cache.get(id)?;
        if !tb.is_valid()
            || tb.pc != key.pc
            || tb.cs_base != key.cs_base
            || tb.flags != key.flags
            || tb.cflags != key.cflags
            || tb.page_addr[0] != Some(key.phys_page0)
        {
            return None;
        }
        if let Some(page1) = tb.page_addr[1] {
            if self.mem.code_page(next_page(tb.pc)).map(page_of) != Some(page1) {
                return None;
            }
        }
        Some(tb)
    }

    /// Compiles the block named by `key` under the generation lock. On
    /// arena exhaustion the whole cache is flushed and compilation retried
    /// once; a second failure is fatal.
    fn generate(
        &self,
        cpu: &VCpu<T::Cpu>,
        key: &TbKey,
    ) -> Result<Arc<TranslationBlock>, DispatchErr> {
        let mut generator = self.generator.lock().unwrap();
        // Racing miss: another CPU may have compiled this block while we
        // waited for the lock.
        if let Some(tb) = self.cache.lookup(key, |vp| self.mem.code_page(vp)) {
            return Ok(tb);
        }
        let req = CompileRequest {
            pc: key.pc,
            cs_base: key.cs_base,
            flags: key.flags,
            cflags: key.cflags,
            phys_page0: key.phys_page0,
        };
        let artifact = match generator.compile(&cpu.arch, &req, &self.arena) {
            Ok(artifact) => artifact,
            Err(CompileError::GuestFault { vector }) => {
                return Err(NonLocalExit::Exception(PendingExcp::Guest(vector)).into());
            }
            Err(CompileError::Exhausted) => {
                debug!(
                    pc = format_args!("{:#x}", key.pc),
                    "code arena full, flushing translation cache",
                );
                self.flush_all_locked();
                match generator.compile(&cpu.arch, &req, &self.arena) {
                    Ok(artifact) => artifact,
                    Err(CompileError::GuestFault { vector }) => {
                        return Err(NonLocalExit::Exception(PendingExcp::Guest(vector)).into());
                    }
                    Err(CompileError::Exhausted) => {
                        return Err(DispatchErr::Fatal(EngineError::CodeArenaExhausted));
                    }
                }
            }
        };
        Ok(self.cache.insert(TbDesc {
            pc: key.pc,
            cs_base: key.cs_base,
            flags: key.flags,
            cflags: key.cflags,
            icount: artifact.icount,
            page_addr: [Some(key.phys_page0), artifact.second_page.map(page_of)],
            code: artifact.code,
            jmp_reset_word: artifact.jump_slots,
        }))
    }

    /// Enters `tb`. `Ok(None)` means the block's code was dropped by a
    /// racing flush before entry; the caller re-dispatches.
    fn cpu_exec_tb(
        &self,
        cpu: &mut VCpu<T::Cpu>,
        tb: Arc<TranslationBlock>,
    ) -> Result<Option<BlockRun>, DispatchErr> {
        let Some(code) = self.arena.exec_view(tb.code) else {
            return Ok(None);
        };
        trace!(
            cpu = cpu.index(),
            pc = format_args!("{:#x}", tb.pc),
            insns = tb.icount,
            "entering tb",
        );
        let signals = cpu.signals().clone();
        let ctx = ExecContext {
            cache: &self.cache,
            arena: &self.arena,
        };
        let run = self
            .backend
            .execute(&mut cpu.arch, &signals, ctx, tb.clone(), &code)
            .map_err(DispatchErr::NonLocal)?;

        // Safe point: apply unlink requests that arrived while we were in
        // generated code.
        link::apply_deferred_unlinks(&self.cache, &self.arena, &tb);
        if !Arc::ptr_eq(&tb, &run.last_tb) {
            link::apply_deferred_unlinks(&self.cache, &self.arena, &run.last_tb);
        }

        if run.exit == TbExit::Requested {
            // The last block never started executing; put the guest state
            // back to its entry point.
            self.target.synchronize_from_tb(&mut cpu.arch, &run.last_tb);
        }
        Ok(Some(run))
    }

    /// Executes the current instruction alone, with every other CPU held
    /// outside generated code.
    fn exec_step_atomic(&self, cpu: &mut VCpu<T::Cpu>) -> Result<(), EngineError> {
        let cpus: Vec<Arc<CpuSignals>> = self.cpus.read().unwrap().clone();
        let self_index = cpu.index();
        let _excl = self.exclusive.start_exclusive(|| {
            for signals in &cpus {
                if signals.index() != self_index {
                    signals.request_exit();
                }
            }
        });

        let cflags = self.curr_cflags().without_parallel().with_count(1);
        let mut chain: Chain = None;
        let result = self
            .tb_find(cpu, cflags, &mut chain)
            .and_then(|tb| self.cpu_exec_tb(cpu, tb));
        match result {
            Ok(_) => Ok(()),
            Err(DispatchErr::Fatal(err)) => Err(err),
            Err(DispatchErr::NonLocal(NonLocalExit::Exception(pending))) => {
                cpu.pending = Some(pending);
                Ok(())
            }
            Err(DispatchErr::NonLocal(NonLocalExit::AtomicStep)) => {
                unreachable!("atomic step requested from within the exclusive region")
            }
        }
    }

    /// Remaining quantum instructions (decrementer low half plus reserve).
    fn cpu_icount(&self, cpu: &VCpu<T::Cpu>) -> u64 {
        u64::from(cpu.signals().icount_decr().low()) + cpu.icount_extra
    }

    fn icount_start(&self, cpu: &mut VCpu<T::Cpu>) {
        let Some(ic) = &self.icount else { return };
        cpu.icount_budget = ic.clock.next_quantum(cpu.index());
        let insns_left = u64::from(CompileFlags::COUNT_MASK).min(cpu.icount_budget);
        cpu.signals().icount_decr().set_budget(insns_left as u16);
        cpu.icount_extra = cpu.icount_budget - insns_left;
    }

    /// Credits instructions executed so far back to the clock.
    fn icount_commit(&self, cpu: &mut VCpu<T::Cpu>) {
        let Some(ic) = &self.icount else { return };
        let left = self.cpu_icount(cpu);
        let executed = cpu.icount_budget.saturating_sub(left);
        if executed > 0 {
            ic.clock.account(cpu.index(), executed);
            cpu.icount_budget = left;
        }
    }

    /// Reloads the 16-bit decrementer from the remaining budget after a
    /// requested exit, and requests an exact-count block when the remainder
    /// is shorter than the block about to run.
    fn icount_refill(&self, cpu: &mut VCpu<T::Cpu>, next_tb: &TranslationBlock) {
        self.icount_commit(cpu);
        let insns_left = u64::from(CompileFlags::COUNT_MASK).min(cpu.icount_budget);
        cpu.signals().icount_decr().set_budget(insns_left as u16);
        cpu.icount_extra = cpu.icount_budget - insns_left;
        if cpu.icount_extra == 0 && insns_left > 0 && (insns_left as u16) < next_tb.icount {
            cpu.cflags_next_tb = Some(self.curr_cflags().with_count(insns_left as u16));
        }
    }

    fn icount_finish(&self, cpu: &mut VCpu<T::Cpu>) {
        if self.icount.is_none() {
            return;
        }
        self.icount_commit(cpu);
        cpu.signals().icount_decr().set_budget(0);
        cpu.icount_extra = 0;
        cpu.icount_budget = 0;
    }
}
