//! Shared mock machine for the engine scenario tests.
//!
//! The "guest program" is a map from pc to a tiny block description; the
//! mock generator compiles those descriptions into arena blocks and the
//! mock backend executes them, following chained exit words the way real
//! generated code would.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vireo_exec::{
    AddressSpace, BlockRun, CodeGenerator, CompileError, CompileRequest, CpuSignals, Engine,
    EngineConfig, ExecBackend, ExecContext, InterruptSet, NonLocalExit, PendingExcp, Target,
    TbArtifact, TbCpuState, TbExit,
};
use vireo_tb::{CodeArena, ExecView, TbId, TranslationBlock, EXIT_TO_DISPATCH, TB_JUMP_SLOTS};

/// Where `deliver_exception` redirects control.
pub const EXC_HANDLER: u64 = 0x9000;
/// Where an accepted hardware interrupt redirects control.
pub const IRQ_HANDLER: u64 = 0x8000;

#[derive(Clone, Copy, Debug)]
pub enum Action {
    /// Set pc to `target` and leave through `slot`.
    Jump { slot: usize, target: u64 },
    /// Like `Jump`, but also raise the CPU's own exit request first.
    ExitJump { slot: usize, target: u64 },
    /// Raise a guest exception mid-block.
    Fault { vector: u32 },
}

#[derive(Clone, Copy, Debug)]
pub struct BlockSpec {
    pub insns: u16,
    /// The block contains a guest atomic; under a parallel compile variant
    /// it must run inside the exclusive region.
    pub atomic: bool,
    /// Backing page the block spills into, when it crosses a boundary.
    pub second_page: Option<u64>,
    pub action: Action,
}

impl BlockSpec {
    pub fn jump(target: u64) -> Self {
        Self {
            insns: 4,
            atomic: false,
            second_page: None,
            action: Action::Jump { slot: 0, target },
        }
    }

    pub fn exit_jump(target: u64) -> Self {
        Self {
            insns: 4,
            atomic: false,
            second_page: None,
            action: Action::ExitJump { slot: 0, target },
        }
    }

    pub fn fault(vector: u32) -> Self {
        Self {
            insns: 4,
            atomic: false,
            second_page: None,
            action: Action::Fault { vector },
        }
    }

    pub fn insns(mut self, insns: u16) -> Self {
        self.insns = insns;
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn spanning(mut self, second_page: u64) -> Self {
        self.second_page = Some(second_page);
        self
    }
}

/// The guest program plus execution/compilation counters, shared between
/// the mock generator, the mock backend and the test body.
pub struct Program {
    blocks: Mutex<HashMap<u64, BlockSpec>>,
    pub compiles: AtomicUsize,
    /// Dispatcher entries into generated code (`execute` calls).
    pub entries: AtomicUsize,
    /// Individual blocks executed, chained hops included.
    pub blocks_run: AtomicUsize,
    pub trace: Mutex<Vec<u64>>,
    /// Blocks currently inside their body, across all CPUs.
    executing: AtomicUsize,
    /// Worst concurrency observed while an atomic block's body ran.
    pub atomic_overlap: AtomicUsize,
}

impl Program {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
            compiles: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
            blocks_run: AtomicUsize::new(0),
            trace: Mutex::new(Vec::new()),
            executing: AtomicUsize::new(0),
            atomic_overlap: AtomicUsize::new(0),
        })
    }

    pub fn define(&self, pc: u64, spec: BlockSpec) {
        self.blocks.lock().unwrap().insert(pc, spec);
    }

    pub fn block(&self, pc: u64) -> Option<BlockSpec> {
        self.blocks.lock().unwrap().get(&pc).copied()
    }

    pub fn trace_snapshot(&self) -> Vec<u64> {
        self.trace.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
pub struct TestCpu {
    pub pc: u64,
    pub delivered: Vec<u32>,
    pub irqs_taken: usize,
    pub resets: usize,
    pub debug_stops: usize,
}

impl TestCpu {
    pub fn at(pc: u64) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }
}

pub struct TestTarget;

impl Target for TestTarget {
    type Cpu = TestCpu;

    fn tb_cpu_state(&self, cpu: &TestCpu) -> TbCpuState {
        TbCpuState {
            pc: cpu.pc,
            cs_base: 0,
            flags: 0,
        }
    }

    fn set_pc(&self, cpu: &mut TestCpu, pc: u64) {
        cpu.pc = pc;
    }

    fn deliver_exception(&self, cpu: &mut TestCpu, vector: u32) {
        cpu.delivered.push(vector);
        cpu.pc = EXC_HANDLER;
    }

    fn exec_interrupt(&self, cpu: &mut TestCpu, pending: InterruptSet) -> InterruptSet {
        if pending.contains(InterruptSet::HARD) {
            cpu.irqs_taken += 1;
            cpu.pc = IRQ_HANDLER;
            pending & (InterruptSet::HARD | InterruptSet::POLL)
        } else {
            // A bare poll is consumed without redirecting control.
            pending & InterruptSet::POLL
        }
    }

    fn cpu_reset(&self, cpu: &mut TestCpu) {
        cpu.resets += 1;
        cpu.pc = 0;
    }

    fn debug_excp_handler(&self, cpu: &mut TestCpu) {
        cpu.debug_stops += 1;
    }

    fn translation_fault(&self, _cpu: &TestCpu, _pc: u64) -> u32 {
        0xE
    }
}

/// Identity-mapped guest memory with pages the test can unmap.
pub struct TestMem {
    unmapped: Mutex<HashSet<u64>>,
}

impl TestMem {
    pub fn new() -> Self {
        Self {
            unmapped: Mutex::new(HashSet::new()),
        }
    }

    pub fn unmap(&self, page: u64) {
        self.unmapped.lock().unwrap().insert(page);
    }

    pub fn map(&self, page: u64) {
        self.unmapped.lock().unwrap().remove(&page);
    }
}

impl AddressSpace for TestMem {
    fn code_page(&self, vaddr_page: u64) -> Option<u64> {
        if self.unmapped.lock().unwrap().contains(&vaddr_page) {
            None
        } else {
            Some(vaddr_page)
        }
    }
}

pub struct TestGen {
    program: Arc<Program>,
}

impl CodeGenerator for TestGen {
    type Cpu = TestCpu;

    fn compile(
        &mut self,
        _cpu: &TestCpu,
        req: &CompileRequest,
        arena: &CodeArena,
    ) -> Result<TbArtifact, CompileError> {
        self.program.compiles.fetch_add(1, Ordering::SeqCst);
        let spec = self
            .program
            .block(req.pc)
            .ok_or(CompileError::GuestFault { vector: 0x6 })?;
        let icount = match req.cflags.count() {
            0 => spec.insns,
            n => n.min(spec.insns),
        };
        let code = arena
            .alloc(TB_JUMP_SLOTS)
            .map_err(|_| CompileError::Exhausted)?;
        Ok(TbArtifact {
            code,
            icount,
            second_page: spec.second_page,
            jump_slots: [Some(0), Some(1)],
        })
    }
}

pub struct TestBackend {
    program: Arc<Program>,
}

impl ExecBackend for TestBackend {
    type Cpu = TestCpu;

    fn execute(
        &self,
        cpu: &mut TestCpu,
        signals: &CpuSignals,
        ctx: ExecContext<'_>,
        entry: Arc<TranslationBlock>,
        code: &ExecView,
    ) -> Result<BlockRun, NonLocalExit> {
        let prog = &self.program;
        prog.entries.fetch_add(1, Ordering::SeqCst);
        let mut tb = entry;
        let mut view = code.clone();
        loop {
            let spec = prog.block(tb.pc).expect("executing a block with no spec");
            if spec.atomic && tb.cflags.parallel() {
                return Err(NonLocalExit::AtomicStep);
            }

            // Prologue, as generated code would emit it.
            if tb.cflags.use_icount() {
                if !signals.icount_decr().consume(tb.icount) {
                    return Ok(BlockRun {
                        last_tb: tb,
                        exit: TbExit::Requested,
                    });
                }
            } else if signals.icount_decr().whole() < 0 {
                return Ok(BlockRun {
                    last_tb: tb,
                    exit: TbExit::Requested,
                });
            }

            // Body.
            let inside = prog.executing.fetch_add(1, Ordering::SeqCst) + 1;
            if spec.atomic {
                prog.atomic_overlap.fetch_max(inside, Ordering::SeqCst);
            }
            std::thread::yield_now();
            prog.blocks_run.fetch_add(1, Ordering::SeqCst);
            prog.trace.lock().unwrap().push(tb.pc);
            prog.executing.fetch_sub(1, Ordering::SeqCst);

            match spec.action {
                Action::Fault { vector } => {
                    return Err(NonLocalExit::Exception(PendingExcp::Guest(vector)));
                }
                Action::Jump { slot, target } | Action::ExitJump { slot, target } => {
                    if matches!(spec.action, Action::ExitJump { .. }) {
                        signals.request_exit();
                    }
                    cpu.pc = target;
                    let Some(word_idx) = tb.jump_reset_word(slot) else {
                        return Ok(BlockRun {
                            last_tb: tb,
                            exit: TbExit::Slot(slot),
                        });
                    };
                    let word = view.exit_word(word_idx);
                    if word == EXIT_TO_DISPATCH {
                        return Ok(BlockRun {
                            last_tb: tb,
                            exit: TbExit::Slot(slot),
                        });
                    }
                    // A chained successor that a flush dropped underneath
                    // us sends control back to the dispatcher.
                    let next = TbId::from_bits(word as u32)
                        .and_then(|id| ctx.cache.get(id))
                        .filter(|next| next.is_valid());
                    let Some(next) = next else {
                        return Ok(BlockRun {
                            last_tb: tb,
                            exit: TbExit::Slot(slot),
                        });
                    };
                    let Some(next_view) = ctx.arena.exec_view(next.code) else {
                        return Ok(BlockRun {
                            last_tb: tb,
                            exit: TbExit::Slot(slot),
                        });
                    };
                    view = next_view;
                    tb = next;
                }
            }
        }
    }
}

pub type TestEngine = Engine<TestTarget, TestBackend, TestGen, TestMem>;

pub fn build_engine(program: &Arc<Program>, config: EngineConfig) -> TestEngine {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    Engine::new(
        config,
        TestTarget,
        TestBackend {
            program: program.clone(),
        },
        TestGen {
            program: program.clone(),
        },
        TestMem::new(),
    )
}
