//! The register stack: a model of the interpreter's operand stack while a trace is recorded.
//!
//! The bottom `reserved` slots model values which were already on the operand stack when the
//! trace was entered. They start out as `None` ("still in the host's stack, not yet read") and are
//! only loaded, by a `stack_load` inserted retroactively into the entry block, when the trace first
//! needs them. `None` slots only ever form a prefix of the register stack.

use super::{
    ir::{Inst, InstIdx, Module, SnapshotIdx},
    CompilationError, ExitFrame, ExitPlan,
};
use crate::host::Pc;
use std::{collections::HashMap, fmt};
use thiserror::Error;
use typed_index_collections::TiVec;
use vob::Vob;

#[derive(Debug, Error)]
pub(crate) enum RegStackError {
    #[error("register stack underflow")]
    Underflow,
    #[error(transparent)]
    Compilation(#[from] CompilationError),
}

#[derive(Clone, Debug)]
pub(crate) struct RegStack {
    slots: Vec<Option<InstIdx>>,
    /// The index in `slots` at which each inlined frame starts, outermost first.
    marks: Vec<usize>,
    /// How many slots were reserved at trace entry?
    reserved: usize,
}

impl RegStack {
    pub(crate) fn new(reserved: usize) -> Self {
        Self {
            slots: vec![None; reserved],
            marks: Vec::new(),
            reserved,
        }
    }

    /// How many values are on the innermost frame's part of the stack?
    pub(crate) fn frame_len(&self) -> usize {
        self.slots.len() - self.base()
    }

    fn base(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    /// How many slots have not yet been read from the host?
    fn unloaded(&self) -> usize {
        self.slots.iter().take_while(|x| x.is_none()).count()
    }

    /// Is the stack exactly as it was when the trace was entered? Slots which have been loaded but
    /// still hold their entry value count as unchanged.
    pub(crate) fn is_entry_state(&self, m: &Module) -> bool {
        self.marks.is_empty()
            && self.slots.len() == self.reserved
            && self.slots.iter().enumerate().all(|(i, x)| match x {
                None => true,
                Some(x) => u32::try_from(self.reserved - 1 - i)
                    .is_ok_and(|depth| m.inst(*x) == Inst::StackLoad { depth }),
            })
    }

    pub(crate) fn push(&mut self, val: InstIdx) {
        self.slots.push(Some(val));
    }

    /// Pop the top of the stack, loading it from the host if necessary.
    pub(crate) fn pop(&mut self, m: &mut Module) -> Result<InstIdx, RegStackError> {
        let x = self.topn(0, m)?;
        self.slots.pop();
        Ok(x)
    }

    /// Pop `n` values without reading them.
    pub(crate) fn discard(&mut self, n: usize) -> Result<(), RegStackError> {
        if n > self.frame_len() {
            return Err(RegStackError::Underflow);
        }
        self.slots.truncate(self.slots.len() - n);
        Ok(())
    }

    /// The slot position of the value `n` below the top of the stack.
    fn pos(&self, n: usize) -> Result<usize, RegStackError> {
        if n >= self.frame_len() {
            return Err(RegStackError::Underflow);
        }
        Ok(self.slots.len() - 1 - n)
    }

    /// Load the slots from `pos` to the end of the unloaded prefix.
    fn load_from(&mut self, pos: usize, m: &mut Module) -> Result<(), RegStackError> {
        for i in pos..self.unloaded() {
            let depth = u32::try_from(self.reserved - 1 - i)
                .map_err(|_| CompilationError::LimitExceeded("stack depth".into()))?;
            self.slots[i] = Some(m.insert_entry(Inst::StackLoad { depth })?);
        }
        Ok(())
    }

    /// Return the value `n` below the top of the stack, loading it from the host if necessary.
    pub(crate) fn topn(&mut self, n: usize, m: &mut Module) -> Result<InstIdx, RegStackError> {
        let pos = self.pos(n)?;
        if self.slots[pos].is_none() {
            self.load_from(pos, m)?;
        }
        self.slots[pos].ok_or_else(|| {
            CompilationError::InternalError("unloaded slot after load".into()).into()
        })
    }

    /// Overwrite the value `n` below the top of the stack.
    pub(crate) fn set(
        &mut self,
        n: usize,
        val: InstIdx,
        m: &mut Module,
    ) -> Result<(), RegStackError> {
        let pos = self.pos(n)?;
        if self.slots[pos].is_none() {
            self.load_from(pos + 1, m)?;
        }
        self.slots[pos] = Some(val);
        Ok(())
    }

    /// Start a new inlined frame whose operand stack is initially empty.
    pub(crate) fn push_frame(&mut self) {
        self.marks.push(self.slots.len());
    }

    /// Discard the innermost inlined frame and everything on its operand stack.
    pub(crate) fn pop_frame(&mut self) -> Result<(), RegStackError> {
        let mark = self.marks.pop().ok_or(RegStackError::Underflow)?;
        self.slots.truncate(mark);
        Ok(())
    }

    pub(crate) fn snapshot(&self, pc: Pc) -> Snapshot {
        Snapshot {
            pc,
            slots: self.slots.clone(),
            marks: self.marks.clone(),
            reserved: self.reserved,
        }
    }
}

/// The state of the register stack at a point where a trace can leave.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) pc: Pc,
    slots: Vec<Option<InstIdx>>,
    marks: Vec<usize>,
    reserved: usize,
}

impl Snapshot {
    /// Every instruction this snapshot needs at exit.
    pub(crate) fn insts(&self) -> impl Iterator<Item = InstIdx> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub(crate) fn exit_plan(&self) -> ExitPlan {
        let unloaded = self.slots.iter().take_while(|x| x.is_none()).count();
        let mut bounds = vec![unloaded];
        bounds.extend(self.marks.iter().copied());
        bounds.push(self.slots.len());
        let frames = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| ExitFrame {
                consumed: if i == 0 {
                    (self.reserved - unloaded) as u32
                } else {
                    0
                },
                vals: self.slots[w[0]..w[1]].iter().flatten().copied().collect(),
            })
            .collect();
        ExitPlan {
            pc: self.pc,
            frames,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(pc {}): [", self.pc)?;
        for (i, x) in self.slots.iter().enumerate() {
            if i > 0 {
                if self.marks.contains(&i) {
                    write!(f, " | ")?;
                } else {
                    write!(f, ", ")?;
                }
            } else if self.marks.contains(&0) {
                write!(f, "| ")?;
            }
            match x {
                Some(x) => write!(f, "%{x}")?,
                None => write!(f, "_")?,
            }
        }
        if !self.slots.is_empty() && self.marks.contains(&self.slots.len()) {
            write!(f, " |")?;
        }
        write!(f, "]")
    }
}

/// All of a trace's snapshots. Identical snapshots at the same pc share an index.
pub(crate) struct SnapshotMap {
    snapshots: TiVec<SnapshotIdx, Snapshot>,
    by_pc: HashMap<Pc, Vec<SnapshotIdx>>,
}

impl SnapshotMap {
    pub(crate) fn new() -> Self {
        Self {
            snapshots: TiVec::new(),
            by_pc: HashMap::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.snapshots.clear();
        self.by_pc.clear();
    }

    pub(crate) fn push(&mut self, snap: Snapshot) -> Result<SnapshotIdx, CompilationError> {
        let existing = self.by_pc.entry(snap.pc).or_default();
        if let Some(x) = existing.iter().find(|x| self.snapshots[**x] == snap) {
            return Ok(*x);
        }
        let idx = SnapshotIdx::try_from(self.snapshots.len())?;
        existing.push(idx);
        self.snapshots.push(snap);
        Ok(idx)
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Make every slot referring to `old` refer to `new`.
    pub(crate) fn replace(&mut self, old: InstIdx, new: InstIdx) {
        for s in self.snapshots.iter_mut() {
            for x in s.slots.iter_mut() {
                if *x == Some(old) {
                    *x = Some(new);
                }
            }
        }
    }

    /// Return a bit vector of length `num_insts` with every instruction referenced by any
    /// snapshot set.
    pub(crate) fn referenced(&self, num_insts: usize) -> Vob {
        let mut v = Vob::from_elem(false, num_insts);
        for s in self.snapshots.iter() {
            for x in s.insts() {
                v.set(usize::from(x), true);
            }
        }
        v
    }
}
