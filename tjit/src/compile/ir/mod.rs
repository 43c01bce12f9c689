//! The trace IR.
//!
//! A [Module] holds the IR of the one trace currently being recorded or compiled. Its
//! instructions live in an [Arena] and refer to each other by [InstIdx]. The IR is organised into
//! [BasicBlock]s, which always form a single linear chain:
//!
//!   * The synthetic entry block (which has no pc) holds every constant and every value loaded
//!     from the operand stack at trace entry. It is executed once per trace invocation and ends
//!     with a jump to the start block.
//!   * The start block is the first block of recorded bytecode. A trace which closes its loop ends
//!     with a jump back to the start block.
//!   * Every later block starts at the target of a recorded branch (or a call or return).
//!
//! Every instruction has a use-list with one entry per occurrence of that instruction as an
//! operand of another instruction. Removed instructions become tombstones: they still occupy an
//! [InstIdx] but are no longer part of any block.

use super::{
    callstack::CallStackModel,
    regstack::SnapshotMap,
    CompilationError, ExitPlan,
};
use crate::{
    arena::Arena,
    host::{BasicOp, CallSite, ConvOp, FixnumOp, FloatOp, Literal, MethodId, Pc, Symbol, ValueType},
};
use indexmap::IndexMap;
use std::fmt;

mod well_formed;

fn index_overflow(typ: &str) -> CompilationError {
    CompilationError::LimitExceeded(format!("index overflow: {typ}"))
}

// Generate common methods for 32-bit index types.
macro_rules! index_32bit {
    ($struct:ident) => {
        #[allow(dead_code)]
        impl $struct {
            /// What is the maximum value this index type can represent?
            pub(crate) fn max() -> Self {
                Self(u32::MAX)
            }

            /// Create an instance of `$struct` without checking whether `v` exceeds the underlying
            /// type's bounds. If it does exceed those bounds, the result will be an instance of
            /// this struct whose values is the `MAX` value the underlying type can represent.
            pub(crate) fn unchecked_from(v: usize) -> Self {
                debug_assert!(u32::try_from(v).is_ok());
                Self(u32::try_from(v).unwrap_or(u32::MAX))
            }
        }

        impl From<$struct> for u32 {
            fn from(s: $struct) -> u32 {
                s.0
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                // u32 -> usize is lossless on every platform we support.
                s.0 as usize
            }
        }

        impl TryFrom<usize> for $struct {
            type Error = CompilationError;

            fn try_from(v: usize) -> Result<Self, Self::Error> {
                u32::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(|u| Self(u))
            }
        }

        impl fmt::Display for $struct {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// An instruction index. One of these is an index into the [Module]'s instruction [Arena].
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct InstIdx(u32);
index_32bit!(InstIdx);

/// A basic block index.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct BlockIdx(u32);
index_32bit!(BlockIdx);

/// An index into a trace's constant pool.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ConstIdx(u32);
index_32bit!(ConstIdx);

/// An index into a [SnapshotMap]. Each snapshot is also a side exit of the compiled trace.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct SnapshotIdx(u32);
index_32bit!(SnapshotIdx);

/// The start of a sequence of arguments in [Module]'s argument pool.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ArgsIdx(u32);
index_32bit!(ArgsIdx);

/// Identifies a trace within a [crate::JitEngine].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct TraceId(u32);
index_32bit!(TraceId);

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Inst {
    /// A removed instruction.
    Tombstone,
    LoadConst(ConstIdx),
    LoadSelf,
    /// Read the value `depth` slots below the top of the operand stack at trace entry.
    StackLoad {
        depth: u32,
    },
    EnvLoad {
        level: u32,
        idx: u32,
    },
    EnvStore {
        level: u32,
        idx: u32,
        val: InstIdx,
    },
    GuardType {
        ty: ValueType,
        val: InstIdx,
        exit: SnapshotIdx,
    },
    /// Leave the trace unless the truthiness of `cond` is `expect`.
    Guard {
        cond: InstIdx,
        expect: bool,
        exit: SnapshotIdx,
    },
    GuardMethodCache {
        site: CallSite,
        recv: InstIdx,
        exit: SnapshotIdx,
    },
    GuardMethodRedefine {
        ty: ValueType,
        op: BasicOp,
        exit: SnapshotIdx,
    },
    GuardProperty {
        recv: InstIdx,
        name: Symbol,
        index: u32,
        exit: SnapshotIdx,
    },
    /// A fixnum operation which leaves the trace if it overflows.
    FixnumArith {
        op: FixnumOp,
        lhs: InstIdx,
        rhs: InstIdx,
        exit: SnapshotIdx,
    },
    /// A fixnum operation which can not overflow.
    FixnumBinop {
        op: FixnumOp,
        lhs: InstIdx,
        rhs: InstIdx,
    },
    FloatBinop {
        op: FloatOp,
        lhs: InstIdx,
        rhs: InstIdx,
    },
    Convert {
        op: ConvOp,
        val: InstIdx,
    },
    ObjectNot {
        val: InstIdx,
    },
    StringAdd {
        lhs: InstIdx,
        rhs: InstIdx,
    },
    AllocString {
        val: InstIdx,
    },
    AllocArray {
        args: ArgsIdx,
        num: u32,
    },
    AllocHash {
        args: ArgsIdx,
        num: u32,
    },
    AllocRange {
        low: InstIdx,
        high: InstIdx,
        exclusive: bool,
    },
    GetProperty {
        recv: InstIdx,
        index: u32,
    },
    SetProperty {
        recv: InstIdx,
        index: u32,
        val: InstIdx,
    },
    GetGlobal {
        name: Symbol,
    },
    SetGlobal {
        name: Symbol,
        val: InstIdx,
    },
    /// Call the method at `site`. The first argument is the receiver. If the call raises, leave
    /// the trace through `exit`, which must describe the state before the call.
    InvokeMethod {
        site: CallSite,
        args: ArgsIdx,
        num: u32,
        exit: SnapshotIdx,
    },
    /// Push an interpreter frame for an inlined call. The first argument is the receiver.
    FramePush {
        method: MethodId,
        return_pc: Pc,
        args: ArgsIdx,
        num: u32,
    },
    FramePop,
    Jump {
        target: BlockIdx,
    },
    /// Unconditionally leave the trace.
    Exit {
        exit: SnapshotIdx,
    },
}

impl Inst {
    /// Return a copy of this instruction with each of its inline operands (i.e. not including
    /// those in the argument pool) mapped through `f`.
    pub(crate) fn map_operands<F>(self, mut f: F) -> Self
    where
        F: FnMut(InstIdx) -> InstIdx,
    {
        match self {
            Inst::EnvStore { level, idx, val } => Inst::EnvStore {
                level,
                idx,
                val: f(val),
            },
            Inst::GuardType { ty, val, exit } => Inst::GuardType {
                ty,
                val: f(val),
                exit,
            },
            Inst::Guard { cond, expect, exit } => Inst::Guard {
                cond: f(cond),
                expect,
                exit,
            },
            Inst::GuardMethodCache { site, recv, exit } => Inst::GuardMethodCache {
                site,
                recv: f(recv),
                exit,
            },
            Inst::GuardProperty {
                recv,
                name,
                index,
                exit,
            } => Inst::GuardProperty {
                recv: f(recv),
                name,
                index,
                exit,
            },
            Inst::FixnumArith { op, lhs, rhs, exit } => Inst::FixnumArith {
                op,
                lhs: f(lhs),
                rhs: f(rhs),
                exit,
            },
            Inst::FixnumBinop { op, lhs, rhs } => Inst::FixnumBinop {
                op,
                lhs: f(lhs),
                rhs: f(rhs),
            },
            Inst::FloatBinop { op, lhs, rhs } => Inst::FloatBinop {
                op,
                lhs: f(lhs),
                rhs: f(rhs),
            },
            Inst::Convert { op, val } => Inst::Convert { op, val: f(val) },
            Inst::ObjectNot { val } => Inst::ObjectNot { val: f(val) },
            Inst::StringAdd { lhs, rhs } => Inst::StringAdd {
                lhs: f(lhs),
                rhs: f(rhs),
            },
            Inst::AllocString { val } => Inst::AllocString { val: f(val) },
            Inst::AllocRange {
                low,
                high,
                exclusive,
            } => Inst::AllocRange {
                low: f(low),
                high: f(high),
                exclusive,
            },
            Inst::GetProperty { recv, index } => Inst::GetProperty {
                recv: f(recv),
                index,
            },
            Inst::SetProperty { recv, index, val } => Inst::SetProperty {
                recv: f(recv),
                index,
                val: f(val),
            },
            Inst::SetGlobal { name, val } => Inst::SetGlobal { name, val: f(val) },
            Inst::Tombstone
            | Inst::LoadConst(_)
            | Inst::LoadSelf
            | Inst::StackLoad { .. }
            | Inst::EnvLoad { .. }
            | Inst::GuardMethodRedefine { .. }
            | Inst::AllocArray { .. }
            | Inst::AllocHash { .. }
            | Inst::GetGlobal { .. }
            | Inst::InvokeMethod { .. }
            | Inst::FramePush { .. }
            | Inst::FramePop
            | Inst::Jump { .. }
            | Inst::Exit { .. } => self,
        }
    }

    /// If this instruction takes operands from the argument pool, return where they start and
    /// how many there are.
    pub(crate) fn args(&self) -> Option<(ArgsIdx, u32)> {
        match self {
            Inst::AllocArray { args, num }
            | Inst::AllocHash { args, num }
            | Inst::InvokeMethod { args, num, .. }
            | Inst::FramePush { args, num, .. } => Some((*args, *num)),
            _ => None,
        }
    }

    pub(crate) fn is_terminator(&self) -> bool {
        matches!(self, Inst::Jump { .. } | Inst::Exit { .. })
    }

    /// If this instruction can leave the trace, return the snapshot it leaves through.
    pub(crate) fn exit(&self) -> Option<SnapshotIdx> {
        match self {
            Inst::GuardType { exit, .. }
            | Inst::Guard { exit, .. }
            | Inst::GuardMethodCache { exit, .. }
            | Inst::GuardMethodRedefine { exit, .. }
            | Inst::GuardProperty { exit, .. }
            | Inst::FixnumArith { exit, .. }
            | Inst::InvokeMethod { exit, .. }
            | Inst::Exit { exit } => Some(*exit),
            _ => None,
        }
    }

    /// Does this instruction change host state beyond allocating fresh objects?
    pub(crate) fn has_side_effect(&self) -> bool {
        match self {
            Inst::EnvStore { .. }
            | Inst::SetProperty { .. }
            | Inst::SetGlobal { .. }
            | Inst::InvokeMethod { .. }
            | Inst::FramePush { .. }
            | Inst::FramePop => true,
            // `to_s` on an arbitrary object dispatches to a method.
            Inst::Convert { op, .. } => *op == ConvOp::ObjectToString,
            _ => false,
        }
    }

    /// Does this instruction produce a value other instructions can use?
    pub(crate) fn defines_value(&self) -> bool {
        match self {
            Inst::LoadConst(_)
            | Inst::LoadSelf
            | Inst::StackLoad { .. }
            | Inst::EnvLoad { .. }
            | Inst::FixnumArith { .. }
            | Inst::FixnumBinop { .. }
            | Inst::FloatBinop { .. }
            | Inst::Convert { .. }
            | Inst::ObjectNot { .. }
            | Inst::StringAdd { .. }
            | Inst::AllocString { .. }
            | Inst::AllocArray { .. }
            | Inst::AllocHash { .. }
            | Inst::AllocRange { .. }
            | Inst::GetProperty { .. }
            | Inst::GetGlobal { .. }
            | Inst::InvokeMethod { .. } => true,
            Inst::Tombstone
            | Inst::EnvStore { .. }
            | Inst::GuardType { .. }
            | Inst::Guard { .. }
            | Inst::GuardMethodCache { .. }
            | Inst::GuardMethodRedefine { .. }
            | Inst::GuardProperty { .. }
            | Inst::SetProperty { .. }
            | Inst::SetGlobal { .. }
            | Inst::FramePush { .. }
            | Inst::FramePop
            | Inst::Jump { .. }
            | Inst::Exit { .. } => false,
        }
    }

    pub(crate) fn display<'a>(&'a self, m: &'a Module, iidx: InstIdx) -> DisplayableInst<'a> {
        DisplayableInst {
            inst: self,
            iidx,
            m,
        }
    }
}

pub(crate) struct DisplayableInst<'a> {
    inst: &'a Inst,
    iidx: InstIdx,
    m: &'a Module,
}

impl fmt::Display for DisplayableInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.m;
        let args = |a: ArgsIdx, n: u32| {
            m.args(a, n)
                .iter()
                .map(|x| format!("%{x}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        if self.inst.defines_value() {
            write!(f, "%{}: ", self.iidx)?;
        }
        match self.inst {
            Inst::Tombstone => write!(f, "tombstone"),
            Inst::LoadConst(c) => write!(f, "load_const {}", m.const_literal(*c)),
            Inst::LoadSelf => write!(f, "load_self"),
            Inst::StackLoad { depth } => write!(f, "stack_load {depth}"),
            Inst::EnvLoad { level, idx } => write!(f, "env_load {level}, {idx}"),
            Inst::EnvStore { level, idx, val } => write!(f, "env_store {level}, {idx}, %{val}"),
            Inst::GuardType { ty, val, exit } => write!(f, "guard_type {ty}, %{val}, exit {exit}"),
            Inst::Guard { cond, expect, exit } => write!(f, "guard {expect}, %{cond}, exit {exit}"),
            Inst::GuardMethodCache { site, recv, exit } => {
                write!(f, "guard_method_cache {}, %{recv}, exit {exit}", site.0)
            }
            Inst::GuardMethodRedefine { ty, op, exit } => {
                write!(f, "guard_method_redefine {ty}, {op}, exit {exit}")
            }
            Inst::GuardProperty {
                recv,
                name,
                index,
                exit,
            } => write!(
                f,
                "guard_property %{recv}, {}, {index}, exit {exit}",
                name.0
            ),
            Inst::FixnumArith { op, lhs, rhs, exit } => {
                write!(f, "fixnum_{op}_overflow %{lhs}, %{rhs}, exit {exit}")
            }
            Inst::FixnumBinop { op, lhs, rhs } => write!(f, "fixnum_{op} %{lhs}, %{rhs}"),
            Inst::FloatBinop { op, lhs, rhs } => write!(f, "float_{op} %{lhs}, %{rhs}"),
            Inst::Convert { op, val } => write!(f, "{op} %{val}"),
            Inst::ObjectNot { val } => write!(f, "object_not %{val}"),
            Inst::StringAdd { lhs, rhs } => write!(f, "string_add %{lhs}, %{rhs}"),
            Inst::AllocString { val } => write!(f, "alloc_string %{val}"),
            Inst::AllocArray { args: a, num } => write!(f, "alloc_array [{}]", args(*a, *num)),
            Inst::AllocHash { args: a, num } => write!(f, "alloc_hash [{}]", args(*a, *num)),
            Inst::AllocRange {
                low,
                high,
                exclusive,
            } => {
                let kind = if *exclusive { "exclusive" } else { "inclusive" };
                write!(f, "alloc_range %{low}, %{high}, {kind}")
            }
            Inst::GetProperty { recv, index } => write!(f, "get_property %{recv}, {index}"),
            Inst::SetProperty { recv, index, val } => {
                write!(f, "set_property %{recv}, {index}, %{val}")
            }
            Inst::GetGlobal { name } => write!(f, "get_global {}", name.0),
            Inst::SetGlobal { name, val } => write!(f, "set_global {}, %{val}", name.0),
            Inst::InvokeMethod {
                site,
                args: a,
                num,
                exit,
            } => write!(
                f,
                "invoke_method {}, [{}], exit {exit}",
                site.0,
                args(*a, *num)
            ),
            Inst::FramePush {
                method,
                return_pc,
                args: a,
                num,
            } => write!(
                f,
                "frame_push {}, {return_pc}, [{}]",
                method.0,
                args(*a, *num)
            ),
            Inst::FramePop => write!(f, "frame_pop"),
            Inst::Jump { target } => write!(f, "jump bb{target}"),
            Inst::Exit { exit } => write!(f, "exit {exit}"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct InstData {
    inst: Inst,
    /// The block this instruction is (or, for a tombstone, was) part of.
    block: BlockIdx,
    /// One entry per occurrence of this instruction as another instruction's operand.
    uses: Vec<InstIdx>,
}

#[derive(Debug)]
pub(crate) struct BasicBlock {
    /// The pc this block starts at. `None` only for the entry block.
    pc: Option<Pc>,
    insts: Vec<InstIdx>,
    pub(crate) csm: CallStackModel,
}

impl BasicBlock {
    fn new(pc: Option<Pc>, csm: CallStackModel) -> Self {
        Self {
            pc,
            insts: Vec::new(),
            csm,
        }
    }

    pub(crate) fn insts(&self) -> &[InstIdx] {
        &self.insts
    }
}

/// The IR of a single trace.
pub(crate) struct Module {
    trace_id: TraceId,
    start_pc: Pc,
    insts: Arena<InstIdx, InstData>,
    blocks: Arena<BlockIdx, BasicBlock>,
    /// The argument pool for instructions with a variable number of operands.
    args: Vec<InstIdx>,
    /// Maps each literal to the instruction in the entry block that loads it, if any.
    consts: IndexMap<Literal, Option<InstIdx>>,
    pub(crate) snapshots: SnapshotMap,
    /// The block instructions are currently appended to.
    cur_block: BlockIdx,
}

impl Module {
    pub(crate) fn new(trace_id: TraceId, start_pc: Pc) -> Result<Self, CompilationError> {
        let mut m = Self {
            trace_id,
            start_pc,
            insts: Arena::new(),
            blocks: Arena::new(),
            args: Vec::new(),
            consts: IndexMap::new(),
            snapshots: SnapshotMap::new(),
            cur_block: BlockIdx(0),
        };
        m.reset(trace_id, start_pc)?;
        Ok(m)
    }

    /// Create an empty module for trace 0 starting at pc 0.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self::new(TraceId(0), Pc(0)).unwrap()
    }

    /// Discard all IR, ready to record the trace `trace_id` starting at `start_pc`.
    pub(crate) fn reset(
        &mut self,
        trace_id: TraceId,
        start_pc: Pc,
    ) -> Result<(), CompilationError> {
        self.trace_id = trace_id;
        self.start_pc = start_pc;
        self.insts.reset();
        self.blocks.reset();
        self.args.clear();
        self.consts.clear();
        self.snapshots.reset();
        let entry = self
            .blocks
            .push(BasicBlock::new(None, CallStackModel::new()))?;
        let start = self
            .blocks
            .push(BasicBlock::new(Some(start_pc), CallStackModel::new()))?;
        self.cur_block = entry;
        self.push_inst(Inst::Jump { target: start })?;
        self.cur_block = start;
        Ok(())
    }

    pub(crate) fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub(crate) fn start_pc(&self) -> Pc {
        self.start_pc
    }

    pub(crate) fn entry_block(&self) -> BlockIdx {
        BlockIdx(0)
    }

    pub(crate) fn start_block(&self) -> BlockIdx {
        BlockIdx(1)
    }

    pub(crate) fn cur_block(&self) -> BlockIdx {
        self.cur_block
    }

    pub(crate) fn set_cur_block(&mut self, bidx: BlockIdx) {
        self.cur_block = bidx;
    }

    pub(crate) fn block(&self, bidx: BlockIdx) -> &BasicBlock {
        &self.blocks[bidx]
    }

    pub(crate) fn block_mut(&mut self, bidx: BlockIdx) -> &mut BasicBlock {
        &mut self.blocks[bidx]
    }

    /// Iterate over all blocks in program order.
    pub(crate) fn blocks(&self) -> impl DoubleEndedIterator<Item = BlockIdx> {
        self.blocks.indices()
    }

    pub(crate) fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    /// Create a new, empty, block starting at `pc` whose call stack model is a clone of the
    /// current block's. The current block is not changed.
    pub(crate) fn push_block(&mut self, pc: Pc) -> Result<BlockIdx, CompilationError> {
        let csm = self.blocks[self.cur_block].csm.clone();
        self.blocks.push(BasicBlock::new(Some(pc), csm))
    }

    /// How many instructions (including tombstones) have been created?
    pub(crate) fn insts_len(&self) -> usize {
        self.insts.len()
    }

    pub(crate) fn inst(&self, iidx: InstIdx) -> Inst {
        self.insts[iidx].inst
    }

    pub(crate) fn inst_block(&self, iidx: InstIdx) -> BlockIdx {
        self.insts[iidx].block
    }

    pub(crate) fn uses(&self, iidx: InstIdx) -> &[InstIdx] {
        &self.insts[iidx].uses
    }

    /// Iterate over every instruction in program order.
    pub(crate) fn program_order(&self) -> Vec<InstIdx> {
        self.blocks()
            .flat_map(|b| self.blocks[b].insts.iter().copied())
            .collect()
    }

    pub(crate) fn args(&self, args: ArgsIdx, num: u32) -> &[InstIdx] {
        let start = usize::from(args);
        &self.args[start..start + num as usize]
    }

    pub(crate) fn push_args(&mut self, args: &[InstIdx]) -> Result<ArgsIdx, CompilationError> {
        let idx = ArgsIdx::try_from(self.args.len())?;
        self.args.extend_from_slice(args);
        Ok(idx)
    }

    /// Return every operand of `iidx`, including those in the argument pool.
    pub(crate) fn operands(&self, iidx: InstIdx) -> Vec<InstIdx> {
        let inst = self.inst(iidx);
        let mut ops = Vec::new();
        inst.map_operands(|x| {
            ops.push(x);
            x
        });
        if let Some((a, n)) = inst.args() {
            ops.extend_from_slice(self.args(a, n));
        }
        ops
    }

    fn new_inst(&mut self, inst: Inst, block: BlockIdx) -> Result<InstIdx, CompilationError> {
        let iidx = self.insts.push(InstData {
            inst,
            block,
            uses: Vec::new(),
        })?;
        for op in self.operands(iidx) {
            self.insts[op].uses.push(iidx);
        }
        Ok(iidx)
    }

    /// Append `inst` to the current block.
    pub(crate) fn push_inst(&mut self, inst: Inst) -> Result<InstIdx, CompilationError> {
        let bidx = self.cur_block;
        let iidx = self.new_inst(inst, bidx)?;
        self.blocks[bidx].insts.push(iidx);
        Ok(iidx)
    }

    /// Insert `inst` into the entry block, before its terminator.
    pub(crate) fn insert_entry(&mut self, inst: Inst) -> Result<InstIdx, CompilationError> {
        let entry = self.entry_block();
        let iidx = self.new_inst(inst, entry)?;
        let insts = &mut self.blocks[entry].insts;
        // The entry block always ends with a jump to the start block.
        insts.insert(insts.len() - 1, iidx);
        Ok(iidx)
    }

    /// Insert `inst` immediately before `before`.
    pub(crate) fn insert_before(
        &mut self,
        before: InstIdx,
        inst: Inst,
    ) -> Result<InstIdx, CompilationError> {
        let bidx = self.insts[before].block;
        let pos = self.blocks[bidx]
            .insts
            .iter()
            .position(|x| *x == before)
            .ok_or_else(|| CompilationError::InternalError(format!("%{before} not in a block")))?;
        let iidx = self.new_inst(inst, bidx)?;
        self.blocks[bidx].insts.insert(pos, iidx);
        Ok(iidx)
    }

    /// Return the instruction which loads `lit`, creating it in the entry block if necessary.
    pub(crate) fn const_(&mut self, lit: Literal) -> Result<InstIdx, CompilationError> {
        let (i, existing) = match self.consts.get_full(&lit) {
            Some((i, _, x)) => (i, *x),
            None => (self.consts.insert_full(lit, None).0, None),
        };
        if let Some(x) = existing {
            return Ok(x);
        }
        let iidx = self.insert_entry(Inst::LoadConst(ConstIdx::try_from(i)?))?;
        if let Some((_, x)) = self.consts.get_index_mut(i) {
            *x = Some(iidx);
        }
        Ok(iidx)
    }

    pub(crate) fn const_literal(&self, cidx: ConstIdx) -> &Literal {
        self.consts
            .get_index(usize::from(cidx))
            .expect("ConstIdx created without a constant")
            .0
    }

    /// If `iidx` loads a constant, return its literal.
    pub(crate) fn literal(&self, iidx: InstIdx) -> Option<&Literal> {
        match self.inst(iidx) {
            Inst::LoadConst(c) => Some(self.const_literal(c)),
            _ => None,
        }
    }

    /// Iterate over the constant pool in [ConstIdx] order. The boolean is `false` for constants
    /// no instruction loads any longer.
    pub(crate) fn consts(&self) -> impl Iterator<Item = (&Literal, bool)> {
        self.consts.iter().map(|(k, v)| (k, v.is_some()))
    }

    /// Replace the instruction `iidx` with `inst` in place, updating use-lists.
    pub(crate) fn replace_inst(
        &mut self,
        iidx: InstIdx,
        inst: Inst,
    ) -> Result<(), CompilationError> {
        if self.inst(iidx).args().is_some() || inst.args().is_some() {
            return Err(CompilationError::InternalError(
                "can't replace instructions with pooled arguments in place".into(),
            ));
        }
        for op in self.operands(iidx) {
            self.remove_use(op, iidx);
        }
        self.insts[iidx].inst = inst;
        for op in self.operands(iidx) {
            self.insts[op].uses.push(iidx);
        }
        Ok(())
    }

    /// Make every user of `old`, and every snapshot referring to `old`, refer to `new` instead.
    /// `old` is left with an empty use-list.
    pub(crate) fn replace_with(&mut self, old: InstIdx, new: InstIdx) {
        debug_assert_ne!(old, new);
        let users = std::mem::take(&mut self.insts[old].uses);
        let mut distinct = users.clone();
        distinct.sort();
        distinct.dedup();
        for u in distinct {
            let inst = self.inst(u).map_operands(|x| if x == old { new } else { x });
            self.insts[u].inst = inst;
            if let Some((a, n)) = inst.args() {
                let start = usize::from(a);
                for x in &mut self.args[start..start + n as usize] {
                    if *x == old {
                        *x = new;
                    }
                }
            }
        }
        self.insts[new].uses.extend(users);
        self.snapshots.replace(old, new);
    }

    fn remove_use(&mut self, of: InstIdx, user: InstIdx) {
        let uses = &mut self.insts[of].uses;
        if let Some(i) = uses.iter().position(|x| *x == user) {
            uses.swap_remove(i);
        }
    }

    /// Remove `iidx`, turning it into a tombstone.
    ///
    /// # Panics
    ///
    /// If `iidx` has a non-empty use-list.
    pub(crate) fn remove(&mut self, iidx: InstIdx) {
        assert!(
            self.insts[iidx].uses.is_empty(),
            "removing %{iidx} which is still used"
        );
        for op in self.operands(iidx) {
            self.remove_use(op, iidx);
        }
        if let Inst::LoadConst(c) = self.inst(iidx) {
            if let Some((_, x)) = self.consts.get_index_mut(usize::from(c)) {
                *x = None;
            }
        }
        let bidx = self.insts[iidx].block;
        self.blocks[bidx].insts.retain(|x| *x != iidx);
        self.insts[iidx].inst = Inst::Tombstone;
    }

    /// Return one [ExitPlan] per snapshot, in [SnapshotIdx] order.
    pub(crate) fn exit_plans(&self) -> Vec<ExitPlan> {
        self.snapshots.iter().map(|s| s.exit_plan()).collect()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self, idx: SnapshotIdx) -> &crate::compile::regstack::Snapshot {
        self.snapshots.iter().nth(usize::from(idx)).unwrap()
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; trace {} start {}", self.trace_id, self.start_pc)?;
        for bidx in self.blocks() {
            let b = &self.blocks[bidx];
            match b.pc {
                None => writeln!(f, "entry:")?,
                Some(pc) => writeln!(f, "bb{bidx} (pc {pc}):")?,
            }
            for iidx in &b.insts {
                writeln!(f, "  {}", self.inst(*iidx).display(self, *iidx))?;
            }
        }
        if self.snapshots.len() > 0 {
            writeln!(f, "exits:")?;
            for (i, s) in self.snapshots.iter().enumerate() {
                writeln!(f, "  {i} {s}")?;
            }
        }
        Ok(())
    }
}

/// Check that `m`'s textual form matches the `fm` pattern `ptn`. Names of the form `%{{x}}` in
/// `ptn` match instruction names such as `%3`: the same name must always match the same
/// instruction, and different names different instructions.
#[cfg(test)]
pub(crate) fn assert_ir_matches(m: &Module, ptn: &str) {
    use fm::FMBuilder;
    use regex::Regex;

    let ptn_re = Regex::new(r"%\{\{.+?\}\}").unwrap();
    let text_re = Regex::new(r"%\d+").unwrap();
    let matcher = FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(ptn_re, text_re)
        .distinct_name_matching(true)
        .build()
        .unwrap();
    if let Err(e) = matcher.matches(&m.to_string()) {
        panic!("{e}");
    }
}
