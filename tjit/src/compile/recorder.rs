//! The trace recorder: translate interpreted bytecode instructions, one at a time, into trace IR.

use super::{
    ir::{Inst, InstIdx, Module, SnapshotIdx},
    opt::guard_elim::guard_is_redundant,
    regstack::{RegStack, RegStackError},
    CompilationError,
};
use crate::{
    config::JitConfig,
    host::{
        BasicOp, BinopKind, Builtin, CallSite, CallTarget, ConvOp, FixnumOp, FloatOp, Frame,
        Insn, Literal, Pc, Symbol, UnopKind, Value, ValueType,
    },
};
use std::collections::HashSet;
use strum::Display;

/// Why did recording a trace stop?
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub(crate) enum TraceEnd {
    #[strum(to_string = "this instruction is already recorded on trace")]
    AlreadyRecorded,
    #[strum(to_string = "trace buffer is full")]
    BufferFull,
    #[strum(to_string = "native method is called")]
    NativeMethod,
    #[strum(to_string = "irregular control transfer")]
    Throw,
    #[strum(to_string = "unsupported instruction")]
    UnsupportedOp,
    #[strum(to_string = "leave to a frame outside the trace")]
    Leave,
    #[strum(to_string = "register stack underflow")]
    RegStackUnderflow,
}

impl TraceEnd {
    /// Is a trace which ended for this reason worth compiling?
    pub(crate) fn compilable(self) -> bool {
        self != TraceEnd::RegStackUnderflow
    }
}

/// The outcome of recording a single instruction.
#[derive(Debug, PartialEq)]
pub(crate) enum Recorded {
    Continue,
    /// The trace is complete: its IR is ready to be optimised.
    End(TraceEnd),
}

enum RecordError {
    /// Stop recording: the instruction being recorded is abandoned.
    Abort(TraceEnd),
    Compilation(CompilationError),
}

impl From<CompilationError> for RecordError {
    fn from(e: CompilationError) -> Self {
        RecordError::Compilation(e)
    }
}

impl From<RegStackError> for RecordError {
    fn from(e: RegStackError) -> Self {
        match e {
            RegStackError::Underflow => RecordError::Abort(TraceEnd::RegStackUnderflow),
            RegStackError::Compilation(e) => RecordError::Compilation(e),
        }
    }
}

pub(crate) struct Recorder {
    m: Module,
    rs: RegStack,
    max_trace_length: usize,
    /// Every pc recorded so far.
    visited: HashSet<Pc>,
    /// Reaching one of these pcs ends the trace (e.g. the start of the root trace when recording
    /// a side trace).
    stop_pcs: Vec<Pc>,
    /// The return pc of each inlined call, outermost first.
    return_pcs: Vec<Pc>,
}

impl Recorder {
    /// Start recording into `m` (which must have been reset to the trace's start pc). The
    /// interpreter's current frame has `stack_len` values on its operand stack.
    pub(crate) fn new(m: Module, config: &JitConfig, stack_len: usize, stop_pcs: Vec<Pc>) -> Self {
        Self {
            m,
            rs: RegStack::new(config.reserved_regstack.min(stack_len)),
            max_trace_length: config.max_trace_length,
            visited: HashSet::with_capacity(config.trace_init_size),
            stop_pcs,
            return_pcs: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn module(&self) -> &Module {
        &self.m
    }

    pub(crate) fn into_module(self) -> Module {
        self.m
    }

    /// Record the instruction `insn` at `pc`, which is about to be executed by the interpreter.
    /// `compiled_start` says whether a compiled trace (other than the one being recorded) starts
    /// at `pc`.
    pub(crate) fn record(
        &mut self,
        frame: &mut dyn Frame,
        pc: Pc,
        insn: &Insn,
        compiled_start: bool,
    ) -> Result<Recorded, CompilationError> {
        if !self.visited.is_empty()
            && (self.visited.contains(&pc) || self.stop_pcs.contains(&pc) || compiled_start)
        {
            self.exit(pc)?;
            return Ok(Recorded::End(TraceEnd::AlreadyRecorded));
        }
        if self.m.insts_len() >= self.max_trace_length {
            self.exit(pc)?;
            return Ok(Recorded::End(TraceEnd::BufferFull));
        }
        self.visited.insert(pc);
        let saved = self.rs.clone();
        match self.translate(frame, pc, insn) {
            Ok(None) => Ok(Recorded::Continue),
            Ok(Some(end)) => Ok(Recorded::End(end)),
            Err(RecordError::Abort(end)) => {
                self.rs = saved;
                self.exit(pc)?;
                Ok(Recorded::End(end))
            }
            Err(RecordError::Compilation(e)) => Err(e),
        }
    }

    /// Leave the trace at `pc` with the register stack as it is now.
    fn exit(&mut self, pc: Pc) -> Result<(), CompilationError> {
        let exit = self.snapshot(pc)?;
        self.m.push_inst(Inst::Exit { exit })?;
        Ok(())
    }

    fn snapshot(&mut self, pc: Pc) -> Result<SnapshotIdx, CompilationError> {
        self.m.snapshots.push(self.rs.snapshot(pc))
    }

    fn push_inst(&mut self, inst: Inst) -> Result<InstIdx, CompilationError> {
        self.m.push_inst(inst)
    }

    fn pop(&mut self) -> Result<InstIdx, RecordError> {
        Ok(self.rs.pop(&mut self.m)?)
    }

    fn topn(&mut self, n: usize) -> Result<InstIdx, RecordError> {
        Ok(self.rs.topn(n, &mut self.m)?)
    }

    /// Pop `n` values, returning them bottom-most first.
    fn pop_n(&mut self, n: usize) -> Result<Vec<InstIdx>, RecordError> {
        let vals = (0..n)
            .rev()
            .map(|i| self.topn(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.rs.discard(n)?;
        Ok(vals)
    }

    fn guard_type(
        &mut self,
        ty: ValueType,
        val: InstIdx,
        exit: SnapshotIdx,
    ) -> Result<(), CompilationError> {
        if !guard_is_redundant(&self.m, ty, val, |_| true) {
            self.push_inst(Inst::GuardType { ty, val, exit })?;
        }
        Ok(())
    }

    fn load_self(&mut self) -> Result<InstIdx, CompilationError> {
        let bidx = self.m.cur_block();
        if let Some(x) = self.m.block(bidx).csm.self_val() {
            return Ok(x);
        }
        let x = self.push_inst(Inst::LoadSelf)?;
        self.m.block_mut(bidx).csm.set_self_val(x);
        Ok(x)
    }

    /// Continue recording in a new block starting at `pc`.
    fn new_block_at(&mut self, pc: Pc) -> Result<(), CompilationError> {
        let target = self.m.push_block(pc)?;
        self.push_inst(Inst::Jump { target })?;
        self.m.set_cur_block(target);
        Ok(())
    }

    /// Transfer control to `target`, closing the loop if possible.
    fn jump(&mut self, target: Pc) -> Result<Option<TraceEnd>, RecordError> {
        if target == self.m.start_pc()
            && self.return_pcs.is_empty()
            && self.rs.is_entry_state(&self.m)
        {
            let target = self.m.start_block();
            self.push_inst(Inst::Jump { target })?;
            return Ok(Some(TraceEnd::AlreadyRecorded));
        }
        self.new_block_at(target)?;
        Ok(None)
    }

    fn translate(
        &mut self,
        frame: &mut dyn Frame,
        pc: Pc,
        insn: &Insn,
    ) -> Result<Option<TraceEnd>, RecordError> {
        match *insn {
            Insn::Nop => (),
            Insn::GetLocal { level, idx } => {
                let bidx = self.m.cur_block();
                let v = match self.m.block(bidx).csm.local(level, idx) {
                    Some(x) => x,
                    None => {
                        let x = self.push_inst(Inst::EnvLoad { level, idx })?;
                        self.m.block_mut(bidx).csm.set_local(level, idx, x);
                        x
                    }
                };
                self.rs.push(v);
            }
            Insn::SetLocal { level, idx } => {
                let val = self.pop()?;
                self.push_inst(Inst::EnvStore { level, idx, val })?;
                let bidx = self.m.cur_block();
                self.m.block_mut(bidx).csm.set_local(level, idx, val);
            }
            Insn::GetInstanceVariable { name } => {
                let exit = self.snapshot(pc)?;
                let (recv, index) = self.property_guards(frame, name, exit)?;
                let v = self.push_inst(Inst::GetProperty { recv, index })?;
                self.rs.push(v);
            }
            Insn::SetInstanceVariable { name } => {
                let exit = self.snapshot(pc)?;
                let val = self.pop()?;
                let (recv, index) = self.property_guards(frame, name, exit)?;
                self.push_inst(Inst::SetProperty { recv, index, val })?;
            }
            Insn::GetGlobal { name } => {
                let v = self.push_inst(Inst::GetGlobal { name })?;
                self.rs.push(v);
            }
            Insn::SetGlobal { name } => {
                let val = self.pop()?;
                self.push_inst(Inst::SetGlobal { name, val })?;
            }
            Insn::PutNil => {
                let v = self.m.const_(Literal::Nil)?;
                self.rs.push(v);
            }
            Insn::PutSelf => {
                let v = self.load_self()?;
                self.rs.push(v);
            }
            Insn::PutObject(x) => {
                let v = self.m.const_(frame.literal(x))?;
                self.rs.push(v);
            }
            Insn::PutString(x) => {
                let val = self.m.const_(frame.literal(x))?;
                let v = self.push_inst(Inst::AllocString { val })?;
                self.rs.push(v);
            }
            Insn::ConcatStrings(n) => {
                let vals = self.pop_n(n as usize)?;
                let v = match vals.split_first() {
                    Some((first, rest)) => {
                        let mut s = self.push_inst(Inst::AllocString { val: *first })?;
                        for rhs in rest {
                            s = self.push_inst(Inst::StringAdd { lhs: s, rhs: *rhs })?;
                        }
                        s
                    }
                    None => {
                        let val = self.m.const_(Literal::String("".into()))?;
                        self.push_inst(Inst::AllocString { val })?
                    }
                };
                self.rs.push(v);
            }
            Insn::ToString => {
                if frame.stack_len() < 1 {
                    return Err(RecordError::Abort(TraceEnd::RegStackUnderflow));
                }
                let ty = frame.value_type(frame.topn(0));
                let op = match ty {
                    ValueType::Fixnum => ConvOp::FixnumToString,
                    ValueType::Float => ConvOp::FloatToString,
                    _ => ConvOp::ObjectToString,
                };
                let exit = self.snapshot(pc)?;
                let val = self.pop()?;
                if op != ConvOp::ObjectToString {
                    self.guard_type(ty, val, exit)?;
                }
                let v = self.push_inst(Inst::Convert { op, val })?;
                self.rs.push(v);
            }
            Insn::NewArray(n) => {
                let vals = self.pop_n(n as usize)?;
                let args = self.m.push_args(&vals)?;
                let v = self.push_inst(Inst::AllocArray { args, num: n })?;
                self.rs.push(v);
            }
            Insn::NewHash(n) => {
                let vals = self.pop_n(n as usize)?;
                let args = self.m.push_args(&vals)?;
                let v = self.push_inst(Inst::AllocHash { args, num: n })?;
                self.rs.push(v);
            }
            Insn::NewRange { exclusive } => {
                let high = self.pop()?;
                let low = self.pop()?;
                let v = self.push_inst(Inst::AllocRange {
                    low,
                    high,
                    exclusive,
                })?;
                self.rs.push(v);
            }
            Insn::Pop => self.rs.discard(1)?,
            Insn::Dup => {
                let v = self.topn(0)?;
                self.rs.push(v);
            }
            Insn::DupN(n) => {
                let vals = (0..n as usize)
                    .rev()
                    .map(|i| self.topn(i))
                    .collect::<Result<Vec<_>, _>>()?;
                for v in vals {
                    self.rs.push(v);
                }
            }
            Insn::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.rs.push(a);
                self.rs.push(b);
            }
            Insn::TopN(n) => {
                let v = self.topn(n as usize)?;
                self.rs.push(v);
            }
            Insn::SetN(n) => {
                let v = self.topn(0)?;
                self.rs.set(n as usize, v, &mut self.m)?;
            }
            Insn::AdjustStack(n) => self.rs.discard(n as usize)?,
            Insn::Send { site, argc, next } => self.send(frame, pc, site, argc, next)?,
            Insn::Leave => {
                let Some(ret) = self.return_pcs.pop() else {
                    return Err(RecordError::Abort(TraceEnd::Leave));
                };
                let v = self.pop()?;
                self.push_inst(Inst::FramePop)?;
                self.rs.pop_frame()?;
                let bidx = self.m.cur_block();
                self.m.block_mut(bidx).csm.pop_frame();
                self.rs.push(v);
                self.new_block_at(ret)?;
            }
            Insn::Throw => return Err(RecordError::Abort(TraceEnd::Throw)),
            Insn::Jump { target } => return self.jump(target),
            Insn::BranchIf { target, next } | Insn::BranchUnless { target, next } => {
                let truthy = frame.is_truthy(frame.topn(0));
                let (taken, not_taken) = match insn.branch_target(|| truthy) {
                    Some(_) => (target, next),
                    None => (next, target),
                };
                let cond = self.pop()?;
                let exit = self.snapshot(not_taken)?;
                if !matches!(self.m.literal(cond), Some(x) if x.is_truthy() == truthy) {
                    self.push_inst(Inst::Guard {
                        cond,
                        expect: truthy,
                        exit,
                    })?;
                }
                return self.jump(taken);
            }
            Insn::OptBinop { op, site } => self.binop(frame, pc, op, site)?,
            Insn::OptUnop { op, site } => self.unop(frame, pc, op, site)?,
            Insn::Other { .. } => return Err(RecordError::Abort(TraceEnd::UnsupportedOp)),
        }
        Ok(None)
    }

    fn ivar_index(frame: &dyn Frame, recv: Value, name: Symbol) -> Result<u32, RecordError> {
        frame
            .ivar_index(recv, name)
            .ok_or(RecordError::Abort(TraceEnd::UnsupportedOp))
    }

    /// Emit the guards needed to access the instance variable `name` of `self`, returning the
    /// instruction holding `self` and the variable's slot.
    fn property_guards(
        &mut self,
        frame: &dyn Frame,
        name: Symbol,
        exit: SnapshotIdx,
    ) -> Result<(InstIdx, u32), RecordError> {
        let index = Self::ivar_index(frame, frame.self_value(), name)?;
        let recv = self.load_self()?;
        self.guard_type(ValueType::Object, recv, exit)?;
        self.push_inst(Inst::GuardProperty {
            recv,
            name,
            index,
            exit,
        })?;
        Ok((recv, index))
    }

    fn send(
        &mut self,
        frame: &mut dyn Frame,
        pc: Pc,
        site: CallSite,
        argc: u32,
        next: Pc,
    ) -> Result<(), RecordError> {
        let nargs = argc as usize;
        if nargs >= frame.stack_len() {
            return Err(RecordError::Abort(TraceEnd::RegStackUnderflow));
        }
        let recv_val = frame.topn(nargs);
        match frame.resolve_call(site, recv_val) {
            CallTarget::Bytecode { method, entry } => {
                let exit = self.snapshot(pc)?;
                let vals = self.pop_n(nargs + 1)?;
                self.push_inst(Inst::GuardMethodCache {
                    site,
                    recv: vals[0],
                    exit,
                })?;
                let args = self.m.push_args(&vals)?;
                self.push_inst(Inst::FramePush {
                    method,
                    return_pc: next,
                    args,
                    num: argc + 1,
                })?;
                self.rs.push_frame();
                self.return_pcs.push(next);
                let bidx = self.m.cur_block();
                self.m.block_mut(bidx).csm.push_frame();
                self.new_block_at(entry)?;
            }
            CallTarget::AttrReader { name } if argc == 0 => {
                let index = Self::ivar_index(frame, recv_val, name)?;
                let exit = self.snapshot(pc)?;
                let recv = self.pop()?;
                self.push_inst(Inst::GuardMethodCache { site, recv, exit })?;
                self.push_inst(Inst::GuardProperty {
                    recv,
                    name,
                    index,
                    exit,
                })?;
                let v = self.push_inst(Inst::GetProperty { recv, index })?;
                self.rs.push(v);
            }
            CallTarget::AttrWriter { name } if argc == 1 => {
                let index = Self::ivar_index(frame, recv_val, name)?;
                let exit = self.snapshot(pc)?;
                let val = self.pop()?;
                let recv = self.pop()?;
                self.push_inst(Inst::GuardMethodCache { site, recv, exit })?;
                self.push_inst(Inst::GuardProperty {
                    recv,
                    name,
                    index,
                    exit,
                })?;
                self.push_inst(Inst::SetProperty { recv, index, val })?;
                self.rs.push(val);
            }
            CallTarget::Builtin(Builtin::ObjectNot) if argc == 0 => {
                let exit = self.snapshot(pc)?;
                let recv = self.pop()?;
                self.push_inst(Inst::GuardMethodCache { site, recv, exit })?;
                let v = self.push_inst(Inst::ObjectNot { val: recv })?;
                self.rs.push(v);
            }
            _ => return Err(RecordError::Abort(TraceEnd::NativeMethod)),
        }
        Ok(())
    }

    /// Call the method at `site` through the host, if the host can resolve it to a native method.
    fn invoke(
        &mut self,
        frame: &dyn Frame,
        site: CallSite,
        argc: u32,
        exit: SnapshotIdx,
    ) -> Result<(), RecordError> {
        let recv_val = frame.topn(argc as usize);
        if frame.resolve_call(site, recv_val) != CallTarget::Native {
            return Err(RecordError::Abort(TraceEnd::UnsupportedOp));
        }
        let vals = self.pop_n(argc as usize + 1)?;
        self.push_inst(Inst::GuardMethodCache {
            site,
            recv: vals[0],
            exit,
        })?;
        let args = self.m.push_args(&vals)?;
        let v = self.push_inst(Inst::InvokeMethod {
            site,
            args,
            num: argc + 1,
            exit,
        })?;
        self.rs.push(v);
        Ok(())
    }

    fn binop(
        &mut self,
        frame: &dyn Frame,
        pc: Pc,
        op: BinopKind,
        site: CallSite,
    ) -> Result<(), RecordError> {
        if frame.stack_len() < 2 {
            return Err(RecordError::Abort(TraceEnd::RegStackUnderflow));
        }
        let lty = frame.value_type(frame.topn(1));
        let rty = frame.value_type(frame.topn(0));
        let exit = self.snapshot(pc)?;
        let redefine = Inst::GuardMethodRedefine {
            ty: lty,
            op: BasicOp::Binop(op),
            exit,
        };
        match (lty, rty, FloatOp::from_binop(op)) {
            (ValueType::Fixnum, ValueType::Fixnum, _) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.guard_type(ValueType::Fixnum, lhs, exit)?;
                self.guard_type(ValueType::Fixnum, rhs, exit)?;
                self.push_inst(redefine)?;
                let op = FixnumOp::from_binop(op);
                let inst = if op.can_overflow() {
                    Inst::FixnumArith { op, lhs, rhs, exit }
                } else {
                    Inst::FixnumBinop { op, lhs, rhs }
                };
                let v = self.push_inst(inst)?;
                self.rs.push(v);
            }
            (
                ValueType::Fixnum | ValueType::Float,
                ValueType::Fixnum | ValueType::Float,
                Some(fop),
            ) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.guard_type(lty, lhs, exit)?;
                self.guard_type(rty, rhs, exit)?;
                self.push_inst(redefine)?;
                let lhs = self.to_float(lty, lhs)?;
                let rhs = self.to_float(rty, rhs)?;
                let v = self.push_inst(Inst::FloatBinop { op: fop, lhs, rhs })?;
                self.rs.push(v);
            }
            (ValueType::String, ValueType::String, _) if op == BinopKind::Plus => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.guard_type(ValueType::String, lhs, exit)?;
                self.guard_type(ValueType::String, rhs, exit)?;
                self.push_inst(redefine)?;
                let v = self.push_inst(Inst::StringAdd { lhs, rhs })?;
                self.rs.push(v);
            }
            _ => self.invoke(frame, site, 1, exit)?,
        }
        Ok(())
    }

    fn to_float(&mut self, ty: ValueType, val: InstIdx) -> Result<InstIdx, CompilationError> {
        if ty == ValueType::Fixnum {
            self.push_inst(Inst::Convert {
                op: ConvOp::FixnumToFloat,
                val,
            })
        } else {
            Ok(val)
        }
    }

    fn unop(
        &mut self,
        frame: &dyn Frame,
        pc: Pc,
        op: UnopKind,
        site: CallSite,
    ) -> Result<(), RecordError> {
        if frame.stack_len() < 1 {
            return Err(RecordError::Abort(TraceEnd::RegStackUnderflow));
        }
        let recv_val = frame.topn(0);
        let ty = frame.value_type(recv_val);
        let exit = self.snapshot(pc)?;
        match op {
            UnopKind::Succ if ty == ValueType::Fixnum => {
                let lhs = self.pop()?;
                self.guard_type(ValueType::Fixnum, lhs, exit)?;
                self.push_inst(Inst::GuardMethodRedefine {
                    ty,
                    op: BasicOp::Unop(op),
                    exit,
                })?;
                let rhs = self.m.const_(Literal::Fixnum(1))?;
                let v = self.push_inst(Inst::FixnumArith {
                    op: FixnumOp::Add,
                    lhs,
                    rhs,
                    exit,
                })?;
                self.rs.push(v);
            }
            UnopKind::Not
                if frame.resolve_call(site, recv_val) == CallTarget::Builtin(Builtin::ObjectNot) =>
            {
                let val = self.pop()?;
                self.push_inst(Inst::GuardMethodCache {
                    site,
                    recv: val,
                    exit,
                })?;
                let v = self.push_inst(Inst::ObjectNot { val })?;
                self.rs.push(v);
            }
            _ => self.invoke(frame, site, 0, exit)?,
        }
        Ok(())
    }

    #[cfg(test)]
    fn regstack(&self) -> &RegStack {
        &self.rs
    }
}
