//! Dead code elimination.

use super::{Budget, Worklist};
use crate::compile::{
    ir::{Inst, Module},
    CompilationError,
};

/// Remove every instruction whose result is unused and which neither has a side effect, can
/// leave the trace, nor is needed by a snapshot.
pub(super) fn dead_code(m: &mut Module, budget: &mut Budget) -> Result<(), CompilationError> {
    let in_snapshot = m.snapshots.referenced(m.insts_len());
    let mut wl = Worklist::new(m);
    while let Some(iidx) = wl.pop() {
        budget.step()?;
        let inst = m.inst(iidx);
        if inst == Inst::Tombstone
            || !m.uses(iidx).is_empty()
            || inst.is_terminator()
            || inst.exit().is_some()
            || inst.has_side_effect()
            || in_snapshot.get(usize::from(iidx)).unwrap_or(false)
        {
            continue;
        }
        let ops = m.operands(iidx);
        m.remove(iidx);
        for op in ops {
            wl.push(op);
        }
    }
    Ok(())
}
