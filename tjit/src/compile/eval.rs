//! A code generator which "compiles" a trace by copying its IR into a compact form which is then
//! interpreted in-process. It needs no external toolchain, which makes it the backend of choice
//! for testing.

use super::{
    ir::{Inst, InstIdx, Module, SnapshotIdx},
    CodegenBackend, CompilationError, CompiledTrace, ExitPlan,
};
use crate::{
    config::JitConfig,
    host::{Ctx, RuntimeTable, Value},
};

pub(crate) struct Eval;

impl CodegenBackend for Eval {
    fn compile(
        &self,
        m: &Module,
        consts: Box<[Value]>,
        runtime: &RuntimeTable,
        _config: &JitConfig,
    ) -> Result<Box<dyn CompiledTrace>, CompilationError> {
        Ok(Box::new(EvalTrace::new(m, consts, *runtime)?))
    }
}

/// An instruction together with its pooled arguments (if any).
#[derive(Debug)]
struct EvalInst {
    iidx: InstIdx,
    inst: Inst,
    args: Box<[InstIdx]>,
}

#[derive(Debug)]
pub(crate) struct EvalTrace {
    /// The instructions of each block, indexed by [super::ir::BlockIdx].
    blocks: Vec<Vec<EvalInst>>,
    consts: Box<[Value]>,
    exits: Vec<ExitPlan>,
    runtime: RuntimeTable,
    num_insts: usize,
}

impl EvalTrace {
    fn new(
        m: &Module,
        consts: Box<[Value]>,
        runtime: RuntimeTable,
    ) -> Result<Self, CompilationError> {
        let mut blocks = Vec::with_capacity(m.blocks_len());
        for bidx in m.blocks() {
            let insts = m
                .block(bidx)
                .insts()
                .iter()
                .map(|iidx| {
                    let inst = m.inst(*iidx);
                    let args = match inst.args() {
                        Some((a, n)) => m.args(a, n).into(),
                        None => Box::new([]) as Box<[InstIdx]>,
                    };
                    EvalInst {
                        iidx: *iidx,
                        inst,
                        args,
                    }
                })
                .collect::<Vec<_>>();
            if !insts.last().is_some_and(|x| x.inst.is_terminator()) {
                return Err(CompilationError::InternalError(format!(
                    "bb{bidx} is not terminated"
                )));
            }
            blocks.push(insts);
        }
        Ok(Self {
            blocks,
            consts,
            exits: m.exit_plans(),
            runtime,
            num_insts: m.insts_len(),
        })
    }

    /// Restore the interpreter to the state described by exit `exit`.
    unsafe fn restore(&self, ctx: Ctx, exit: SnapshotIdx, vals: &[Value]) -> SnapshotIdx {
        let plan = &self.exits[usize::from(exit)];
        for (from_top, frame) in plan.frames_from_top() {
            let xs = frame
                .vals
                .iter()
                .map(|x| vals[usize::from(*x)])
                .collect::<Vec<_>>();
            unsafe {
                (self.runtime.stack_restore)(
                    ctx,
                    from_top,
                    frame.consumed,
                    xs.len() as u32,
                    xs.as_ptr(),
                )
            };
        }
        exit
    }
}

impl CompiledTrace for EvalTrace {
    unsafe fn invoke(&self, ctx: Ctx) -> SnapshotIdx {
        let rt = &self.runtime;
        let mut vals = vec![Value(0); self.num_insts];
        let gather = |vals: &[Value], args: &[InstIdx]| {
            args.iter()
                .map(|x| vals[usize::from(*x)])
                .collect::<Vec<_>>()
        };
        let mut bidx = 0;
        loop {
            let mut next = None;
            for ei in &self.blocks[bidx] {
                let v = |x: InstIdx| vals[usize::from(x)];
                let r = unsafe {
                    match ei.inst {
                        Inst::Tombstone => continue,
                        Inst::LoadConst(c) => self.consts[usize::from(c)],
                        Inst::LoadSelf => (rt.load_self)(ctx),
                        Inst::StackLoad { depth } => (rt.stack_load)(ctx, depth),
                        Inst::EnvLoad { level, idx } => (rt.env_load)(ctx, level, idx),
                        Inst::EnvStore { level, idx, val } => {
                            (rt.env_store)(ctx, level, idx, v(val));
                            continue;
                        }
                        Inst::GuardType { ty, val, exit } => {
                            if (rt.guard_type)(ctx, v(val), ty as u32) == 0 {
                                return self.restore(ctx, exit, &vals);
                            }
                            continue;
                        }
                        Inst::Guard { cond, expect, exit } => {
                            if ((rt.truthy)(ctx, v(cond)) != 0) != expect {
                                return self.restore(ctx, exit, &vals);
                            }
                            continue;
                        }
                        Inst::GuardMethodCache { site, recv, exit } => {
                            if (rt.method_cache_valid)(ctx, site.0, v(recv)) == 0 {
                                return self.restore(ctx, exit, &vals);
                            }
                            continue;
                        }
                        Inst::GuardMethodRedefine { ty, op, exit } => {
                            if (rt.method_unredefined)(ctx, ty as u32, op.to_u32()) == 0 {
                                return self.restore(ctx, exit, &vals);
                            }
                            continue;
                        }
                        Inst::GuardProperty {
                            recv,
                            name,
                            index,
                            exit,
                        } => {
                            if (rt.property_valid)(ctx, v(recv), name.0, index) == 0 {
                                return self.restore(ctx, exit, &vals);
                            }
                            continue;
                        }
                        Inst::FixnumArith { op, lhs, rhs, exit } => {
                            let mut out = Value(0);
                            if (rt.fixnum_op)(ctx, op as u32, v(lhs), v(rhs), &mut out) != 0 {
                                return self.restore(ctx, exit, &vals);
                            }
                            out
                        }
                        Inst::FixnumBinop { op, lhs, rhs } => {
                            let mut out = Value(0);
                            (rt.fixnum_op)(ctx, op as u32, v(lhs), v(rhs), &mut out);
                            out
                        }
                        Inst::FloatBinop { op, lhs, rhs } => {
                            (rt.float_op)(ctx, op as u32, v(lhs), v(rhs))
                        }
                        Inst::Convert { op, val } => (rt.convert)(ctx, op as u32, v(val)),
                        Inst::ObjectNot { val } => (rt.object_not)(ctx, v(val)),
                        Inst::StringAdd { lhs, rhs } => (rt.string_add)(ctx, v(lhs), v(rhs)),
                        Inst::AllocString { val } => (rt.alloc_string)(ctx, v(val)),
                        Inst::AllocArray { num, .. } => {
                            let xs = gather(&vals, &ei.args);
                            (rt.alloc_array)(ctx, num, xs.as_ptr())
                        }
                        Inst::AllocHash { num, .. } => {
                            let xs = gather(&vals, &ei.args);
                            (rt.alloc_hash)(ctx, num, xs.as_ptr())
                        }
                        Inst::AllocRange {
                            low,
                            high,
                            exclusive,
                        } => (rt.alloc_range)(ctx, v(low), v(high), u8::from(exclusive)),
                        Inst::GetProperty { recv, index } => {
                            (rt.get_property)(ctx, v(recv), index)
                        }
                        Inst::SetProperty { recv, index, val } => {
                            (rt.set_property)(ctx, v(recv), index, v(val));
                            continue;
                        }
                        Inst::GetGlobal { name } => (rt.get_global)(ctx, name.0),
                        Inst::SetGlobal { name, val } => {
                            (rt.set_global)(ctx, name.0, v(val));
                            continue;
                        }
                        Inst::InvokeMethod { site, num, exit, .. } => {
                            let xs = gather(&vals, &ei.args);
                            let mut out = Value(0);
                            if (rt.invoke_method)(ctx, site.0, num, xs.as_ptr(), &mut out) != 0 {
                                return self.restore(ctx, exit, &vals);
                            }
                            out
                        }
                        Inst::FramePush {
                            method,
                            return_pc,
                            num,
                            ..
                        } => {
                            let xs = gather(&vals, &ei.args);
                            (rt.frame_push)(ctx, method.0, return_pc.0, num, xs.as_ptr());
                            continue;
                        }
                        Inst::FramePop => {
                            (rt.frame_pop)(ctx);
                            continue;
                        }
                        Inst::Jump { target } => {
                            next = Some(usize::from(target));
                            break;
                        }
                        Inst::Exit { exit } => return self.restore(ctx, exit, &vals),
                    }
                };
                vals[usize::from(ei.iidx)] = r;
            }
            match next {
                Some(x) => bidx = x,
                // Every block ends with a terminator.
                None => unreachable!(),
            }
        }
    }
}
