//! Guard elimination.
//!
//! A `guard_type` is redundant if the instruction producing its operand already proves the type,
//! or if an identical guard on the same value was executed earlier. Since a trace's blocks form a
//! single chain, "earlier in program order" is enough for the latter. A `guard` on a constant
//! whose truthiness is the expected one is always redundant.

use super::{Budget, Worklist};
use crate::{
    compile::{
        ir::{Inst, InstIdx, Module},
        CompilationError,
    },
    host::{ConvOp, ValueType},
};

pub(super) fn guard_elim(m: &mut Module, budget: &mut Budget) -> Result<(), CompilationError> {
    let mut pos = vec![usize::MAX; m.insts_len()];
    for (i, iidx) in m.program_order().into_iter().enumerate() {
        pos[usize::from(iidx)] = i;
    }
    let mut wl = Worklist::new(m);
    while let Some(iidx) = wl.pop() {
        budget.step()?;
        let redundant = match m.inst(iidx) {
            Inst::GuardType { ty, val, .. } => guard_is_redundant(m, ty, val, |g| {
                g != iidx && pos[usize::from(g)] < pos[usize::from(iidx)]
            }),
            Inst::Guard { cond, expect, .. } => {
                matches!(m.literal(cond), Some(x) if x.is_truthy() == expect)
            }
            _ => false,
        };
        if redundant {
            m.remove(iidx);
        }
    }
    Ok(())
}

/// If the type of the value produced by `iidx` is known statically, return it.
pub(crate) fn known_type(m: &Module, iidx: InstIdx) -> Option<ValueType> {
    match m.inst(iidx) {
        Inst::LoadConst(_) => m.literal(iidx).map(|x| x.value_type()),
        Inst::AllocString { .. } | Inst::StringAdd { .. } => Some(ValueType::String),
        Inst::AllocArray { .. } => Some(ValueType::Array),
        Inst::AllocHash { .. } => Some(ValueType::Hash),
        Inst::AllocRange { .. } => Some(ValueType::Range),
        Inst::FixnumArith { op, .. } | Inst::FixnumBinop { op, .. } if !op.is_compare() => {
            Some(ValueType::Fixnum)
        }
        Inst::FloatBinop { op, .. } if !op.is_compare() => Some(ValueType::Float),
        Inst::Convert { op, .. } => Some(match op {
            ConvOp::FixnumToFloat => ValueType::Float,
            ConvOp::FixnumToString | ConvOp::FloatToString | ConvOp::ObjectToString => {
                ValueType::String
            }
        }),
        _ => None,
    }
}

/// Would a `guard_type ty, val` be redundant? `earlier(g)` must return true iff the guard `g`
/// is executed before the guard under consideration.
pub(crate) fn guard_is_redundant<F>(m: &Module, ty: ValueType, val: InstIdx, earlier: F) -> bool
where
    F: Fn(InstIdx) -> bool,
{
    if known_type(m, val) == Some(ty) {
        return true;
    }
    m.uses(val).iter().any(|u| {
        matches!(m.inst(*u), Inst::GuardType { ty: uty, val: uval, .. } if uty == ty && uval == val)
            && earlier(*u)
    })
}
