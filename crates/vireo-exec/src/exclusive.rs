//! The exclusive-execution coordinator.
//!
//! Some guest instructions (atomic read-modify-write under the wrong
//! compile variant) can only be emulated correctly with every other CPU
//! stopped. The coordinator tracks how many CPUs are inside their dispatch
//! loop ("running") and lets one thread claim an exclusive region: new
//! runners wait at the door, current runners are kicked out of generated
//! code by the caller, and the claim completes once the running count
//! drains to zero. Both sides release through RAII guards so no error path
//! can leak the region.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct ExclState {
    /// CPUs currently inside their dispatch loop.
    running: usize,
    /// An exclusive region is claimed or being claimed.
    exclusive: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ExclusiveCoordinator {
    state: Mutex<ExclState>,
    cond: Condvar,
}

impl ExclusiveCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enters the running region, waiting out any exclusive region first.
    pub(crate) fn begin_run(&self) -> RunGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.exclusive {
            state = self.cond.wait(state).unwrap();
        }
        state.running += 1;
        RunGuard { coord: self }
    }

    /// Claims the exclusive region. `kick` is invoked once the claim is
    /// registered and must make every running CPU leave generated code;
    /// the call returns when the last of them has left the running region.
    pub(crate) fn start_exclusive(&self, kick: impl FnOnce()) -> ExclusiveGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.exclusive {
            state = self.cond.wait(state).unwrap();
        }
        state.exclusive = true;
        kick();
        while state.running > 0 {
            state = self.cond.wait(state).unwrap();
        }
        ExclusiveGuard { coord: self }
    }

    #[cfg(test)]
    fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }
}

pub(crate) struct RunGuard<'a> {
    coord: &'a ExclusiveCoordinator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coord.state.lock().unwrap();
        state.running -= 1;
        drop(state);
        self.coord.cond.notify_all();
    }
}

pub(crate) struct ExclusiveGuard<'a> {
    coord: &'a ExclusiveCoordinator,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coord.state.lock().unwrap();
        state.exclusive = false;
        drop(state);
        self.coord.cond.notify_all();
    }
}
