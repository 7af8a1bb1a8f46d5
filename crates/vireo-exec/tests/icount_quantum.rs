//! Deterministic-execution tests: quantum accounting, exact-count tail
//! blocks and wall-clock alignment, driven by a fake instruction clock.

mod common;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{build_engine, BlockSpec, Program, TestCpu};
use vireo_exec::{EngineConfig, ExitStatus, IcountMode, InstructionClock, VCpu};

/// One instruction is one virtual nanosecond; real time stands still and
/// sleeps are recorded instead of performed.
struct FakeClock {
    quantum: u64,
    retired: AtomicU64,
    realtime_ns: AtomicI64,
    slept_ns: AtomicU64,
}

impl FakeClock {
    fn new(quantum: u64) -> Arc<Self> {
        Arc::new(Self {
            quantum,
            retired: AtomicU64::new(0),
            realtime_ns: AtomicI64::new(0),
            slept_ns: AtomicU64::new(0),
        })
    }
}

impl InstructionClock for FakeClock {
    fn next_quantum(&self, _cpu_index: usize) -> u64 {
        self.quantum
    }

    fn account(&self, _cpu_index: usize, retired: u64) {
        self.retired.fetch_add(retired, Ordering::SeqCst);
    }

    fn virtual_ns(&self) -> i64 {
        self.retired.load(Ordering::SeqCst) as i64
    }

    fn realtime_ns(&self) -> i64 {
        self.realtime_ns.load(Ordering::SeqCst)
    }

    fn icount_to_ns(&self, icount: i64) -> i64 {
        icount
    }

    fn sleep(&self, duration: Duration) {
        self.slept_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

fn icount_config(clock: &Arc<FakeClock>, align: bool) -> EngineConfig {
    EngineConfig {
        icount: Some(IcountMode {
            clock: clock.clone() as Arc<dyn InstructionClock>,
            align,
        }),
        ..EngineConfig::default()
    }
}

#[test]
fn quantum_is_retired_exactly_with_an_exact_count_tail() {
    let prog = Program::new();
    // 7-instruction blocks against a quantum of 100: fourteen whole blocks
    // leave a remainder of 2 that no full block fits.
    prog.define(0x1000, BlockSpec::jump(0x1000).insns(7));
    let clock = FakeClock::new(100);
    let engine = build_engine(&prog, icount_config(&clock, false));
    let mut cpu = VCpu::new(0, TestCpu::at(0x1000));
    engine.register_cpu(&cpu);

    assert_eq!(engine.run(&mut cpu).unwrap(), ExitStatus::Interrupt);

    // Every quantum instruction was retired to the clock, no more.
    assert_eq!(clock.retired.load(Ordering::SeqCst), 100);
    // 14 full blocks plus one 2-instruction block compiled for the tail.
    assert_eq!(prog.blocks_run.load(Ordering::SeqCst), 15);
    assert_eq!(prog.compiles.load(Ordering::SeqCst), 2);
}

#[test]
fn quantum_exhaustion_repeats_cleanly_across_runs() {
    let prog = Program::new();
    prog.define(0x1000, BlockSpec::jump(0x1000).insns(10));
    let clock = FakeClock::new(50);
    let engine = build_engine(&prog, icount_config(&clock, false));
    let mut cpu = VCpu::new(0, TestCpu::at(0x1000));
    engine.register_cpu(&cpu);

    // 10 divides 50: no exact-count tail, one compilation total.
    assert_eq!(engine.run(&mut cpu).unwrap(), ExitStatus::Interrupt);
    assert_eq!(clock.retired.load(Ordering::SeqCst), 50);
    assert_eq!(prog.blocks_run.load(Ordering::SeqCst), 5);

    assert_eq!(engine.run(&mut cpu).unwrap(), ExitStatus::Interrupt);
    assert_eq!(clock.retired.load(Ordering::SeqCst), 100);
    assert_eq!(prog.blocks_run.load(Ordering::SeqCst), 10);
    assert_eq!(prog.compiles.load(Ordering::SeqCst), 1);
}

#[test]
fn guest_running_ahead_of_real_time_sleeps_the_excess() {
    let prog = Program::new();
    prog.define(0x1000, BlockSpec::jump(0x1000).insns(50_000));
    // Real time never advances, so every executed instruction is guest
    // clock advance; the 3 ms cap is crossed after 61 blocks.
    let clock = FakeClock::new(5_000_000);
    let engine = build_engine(&prog, icount_config(&clock, true));
    let mut cpu = VCpu::new(0, TestCpu::at(0x1000));
    engine.register_cpu(&cpu);

    assert_eq!(engine.run(&mut cpu).unwrap(), ExitStatus::Interrupt);

    assert_eq!(clock.retired.load(Ordering::SeqCst), 5_000_000);
    // 61 * 50_000 ns accumulated when the cap tripped; the whole excess is
    // slept in one go and the remaining 39 blocks stay under the cap.
    assert_eq!(clock.slept_ns.load(Ordering::SeqCst), 3_050_000);
}

#[test]
fn drift_is_reported_only_when_aligning() {
    let prog = Program::new();
    prog.define(0x1000, BlockSpec::jump(0x1000).insns(10));

    let clock = FakeClock::new(50);
    let engine = build_engine(&prog, icount_config(&clock, false));
    let mut cpu = VCpu::new(0, TestCpu::at(0x1000));
    engine.register_cpu(&cpu);
    assert_eq!(engine.run(&mut cpu).unwrap(), ExitStatus::Interrupt);
    assert!(engine.drift_info().is_none());

    let prog = Program::new();
    prog.define(0x1000, BlockSpec::jump(0x1000).insns(10));
    let clock = FakeClock::new(50);
    // The guest starts 1 ms behind real time.
    clock.realtime_ns.store(1_000_000, Ordering::SeqCst);
    let engine = build_engine(&prog, icount_config(&clock, true));
    let mut cpu = VCpu::new(0, TestCpu::at(0x1000));
    engine.register_cpu(&cpu);
    assert_eq!(engine.run(&mut cpu).unwrap(), ExitStatus::Interrupt);

    let info = engine.drift_info().expect("alignment active");
    assert_eq!(info.max_delay, Duration::from_millis(1));
    assert_eq!(info.max_advance, Duration::ZERO);
}
