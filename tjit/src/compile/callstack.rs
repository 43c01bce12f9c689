//! A shadow of the interpreter's call stack for the frames inlined into a trace.
//!
//! Each inlined call level has a [VariableTable] recording which instruction currently holds the
//! value of a local variable, so that repeated `getlocal`s of the same variable within a block do
//! not need to reload it from the host. Every [super::ir::BasicBlock] owns a clone of the model
//! as it was when the block was created.

use super::ir::InstIdx;
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub(crate) struct VariableTable {
    /// Maps `(level, idx)` to the instruction holding that local's current value.
    locals: HashMap<(u32, u32), InstIdx>,
    /// The instruction which loaded `self`, if any.
    self_val: Option<InstIdx>,
}

#[derive(Clone, Debug)]
pub(crate) struct CallStackModel {
    /// One table per inlined frame; the last element is the innermost frame. Never empty.
    tables: Vec<VariableTable>,
}

impl CallStackModel {
    pub(crate) fn new() -> Self {
        Self {
            tables: vec![VariableTable::default()],
        }
    }

    /// How many inlined frames deep are we? The frame the trace started in has depth 0.
    pub(crate) fn depth(&self) -> usize {
        self.tables.len() - 1
    }

    pub(crate) fn push_frame(&mut self) {
        self.tables.push(VariableTable::default());
    }

    /// Discard the innermost frame's table. There must be at least one inlined frame.
    pub(crate) fn pop_frame(&mut self) {
        debug_assert!(self.depth() > 0);
        self.tables.pop();
    }

    fn innermost(&self) -> &VariableTable {
        &self.tables[self.tables.len() - 1]
    }

    fn innermost_mut(&mut self) -> &mut VariableTable {
        let i = self.tables.len() - 1;
        &mut self.tables[i]
    }

    pub(crate) fn local(&self, level: u32, idx: u32) -> Option<InstIdx> {
        self.innermost().locals.get(&(level, idx)).copied()
    }

    pub(crate) fn set_local(&mut self, level: u32, idx: u32, val: InstIdx) {
        self.innermost_mut().locals.insert((level, idx), val);
    }

    pub(crate) fn self_val(&self) -> Option<InstIdx> {
        self.innermost().self_val
    }

    pub(crate) fn set_self_val(&mut self, val: InstIdx) {
        self.innermost_mut().self_val = Some(val);
    }
}
