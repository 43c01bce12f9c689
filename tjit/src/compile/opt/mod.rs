//! The trace optimiser.
//!
//! Three worklist passes are run in order: [fold], [guard_elim], and [dead_code]. Each pass is
//! seeded with every instruction in program order and re-enqueues instructions whose operands it
//! changed. The total number of worklist steps across all passes is capped: if the cap is hit,
//! optimisation (and thus compilation) fails rather than looping indefinitely.

use super::{
    ir::{InstIdx, Module},
    CompilationError,
};
use crate::config::JitConfig;
use std::collections::VecDeque;
use vob::Vob;

mod dead_code;
pub(crate) mod fold;
pub(crate) mod guard_elim;

/// Optimise `m` in place.
pub(crate) fn optimise(m: &mut Module, config: &JitConfig) -> Result<(), CompilationError> {
    let mut budget = Budget::new(
        config
            .opt_iteration_factor
            .saturating_mul(m.insts_len() + 1),
    );
    fold::fold(m, config, &mut budget)?;
    guard_elim::guard_elim(m, &mut budget)?;
    dead_code::dead_code(m, &mut budget)?;
    Ok(())
}

/// How many more worklist steps may the optimiser take?
pub(super) struct Budget(usize);

impl Budget {
    pub(super) fn new(steps: usize) -> Self {
        Self(steps)
    }

    pub(super) fn step(&mut self) -> Result<(), CompilationError> {
        match self.0.checked_sub(1) {
            Some(x) => {
                self.0 = x;
                Ok(())
            }
            None => Err(CompilationError::LimitExceeded(
                "optimiser iteration limit reached".into(),
            )),
        }
    }
}

/// A FIFO queue of instructions in which each instruction appears at most once.
pub(super) struct Worklist {
    queue: VecDeque<InstIdx>,
    queued: Vob,
}

impl Worklist {
    /// Create a worklist seeded with every instruction in `m` in program order.
    pub(super) fn new(m: &Module) -> Self {
        let mut wl = Self {
            queue: VecDeque::new(),
            queued: Vob::from_elem(false, m.insts_len()),
        };
        for iidx in m.program_order() {
            wl.push(iidx);
        }
        wl
    }

    pub(super) fn push(&mut self, iidx: InstIdx) {
        let i = usize::from(iidx);
        if i >= self.queued.len() {
            self.queued.resize(i + 1, false);
        }
        if !self.queued.get(i).unwrap_or(false) {
            self.queued.set(i, true);
            self.queue.push_back(iidx);
        }
    }

    pub(super) fn pop(&mut self) -> Option<InstIdx> {
        let iidx = self.queue.pop_front()?;
        self.queued.set(usize::from(iidx), false);
        Some(iidx)
    }
}
