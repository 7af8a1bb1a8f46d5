//! The per-CPU dispatch and execution engine of the binary translator.
//!
//! This crate drives the translation blocks managed by `vireo-tb`: it owns
//! the dispatch loop (find block, execute, chain, poll interrupts), the
//! exception/interrupt state machine, deterministic instruction counting
//! with optional wall-clock alignment, and the exclusive-execution region
//! used for guest atomics.
//!
//! The guest architecture, memory layout, code generator and execution
//! mechanism are all injected through the traits in [`hooks`]; the engine
//! itself is architecture-agnostic and holds no global state.

pub mod cpu;
pub mod engine;
mod exclusive;
pub mod hooks;
pub mod icount;

pub use cpu::{
    CpuSignals, ExitStatus, IcountDecr, InterruptSet, NonLocalExit, PendingExcp, VCpu,
};
pub use engine::{Engine, EngineConfig, EngineError};
pub use hooks::{
    AddressSpace, BlockRun, CodeGenerator, CompileError, CompileRequest, ExecBackend, ExecContext,
    Target, TbArtifact, TbCpuState, TbExit,
};
pub use icount::{DriftInfo, IcountMode, InstructionClock};
