//! Constant folding.

use super::{Budget, Worklist};
use crate::{
    compile::{
        ir::{Inst, InstIdx, Module},
        CompilationError,
    },
    config::JitConfig,
    host::{ConvOp, FixnumOp, FloatOp, Literal},
};

pub(super) fn fold(
    m: &mut Module,
    config: &JitConfig,
    budget: &mut Budget,
) -> Result<(), CompilationError> {
    let mut wl = Worklist::new(m);
    while let Some(iidx) = wl.pop() {
        budget.step()?;
        if let Some(new) = fold_inst(m, config, iidx)? {
            for u in m.uses(iidx).to_vec() {
                wl.push(u);
            }
            m.replace_with(iidx, new);
            // Anything we fold is free of side effects once folded.
            m.remove(iidx);
            wl.push(new);
        }
    }
    Ok(())
}

/// If `iidx` can be folded, return the instruction that replaces it. The caller is responsible
/// for rewriting `iidx`'s users.
fn fold_inst(
    m: &mut Module,
    config: &JitConfig,
    iidx: InstIdx,
) -> Result<Option<InstIdx>, CompilationError> {
    match m.inst(iidx) {
        Inst::FixnumArith { op, lhs, rhs, .. } => {
            if let (Some(Literal::Fixnum(a)), Some(Literal::Fixnum(b))) =
                (m.literal(lhs), m.literal(rhs))
            {
                if eval_fixnum(config, op, *a, *b).is_some() {
                    // The operation can't overflow so it no longer needs an exit.
                    m.replace_inst(iidx, Inst::FixnumBinop { op, lhs, rhs })?;
                    return fold_inst(m, config, iidx);
                }
            }
            Ok(None)
        }
        Inst::FixnumBinop { op, lhs, rhs } => {
            match (m.literal(lhs), m.literal(rhs)) {
                (Some(Literal::Fixnum(a)), Some(Literal::Fixnum(b))) => {
                    match eval_fixnum(config, op, *a, *b) {
                        Some(x) => Ok(Some(m.const_(x)?)),
                        None => Ok(None),
                    }
                }
                _ => Ok(None),
            }
        }
        Inst::FloatBinop { op, lhs, rhs } => match (m.literal(lhs), m.literal(rhs)) {
            (Some(Literal::Float(a)), Some(Literal::Float(b))) => {
                let x = eval_float(op, f64::from_bits(*a), f64::from_bits(*b));
                Ok(Some(m.const_(x)?))
            }
            _ => Ok(None),
        },
        Inst::Convert { op, val } => {
            let Some(lit) = m.literal(val) else {
                return Ok(None);
            };
            match (op, lit) {
                (ConvOp::FixnumToFloat, Literal::Fixnum(x)) => {
                    let x = Literal::float(*x as f64);
                    Ok(Some(m.const_(x)?))
                }
                (ConvOp::FixnumToString | ConvOp::ObjectToString, Literal::Fixnum(x)) => {
                    let s = x.to_string();
                    fresh_string(m, iidx, &s).map(Some)
                }
                (ConvOp::ObjectToString, Literal::Nil) => fresh_string(m, iidx, "").map(Some),
                (ConvOp::ObjectToString, Literal::Bool(b)) => {
                    let s = b.to_string();
                    fresh_string(m, iidx, &s).map(Some)
                }
                // `to_s` on a string is the identity.
                (ConvOp::ObjectToString, Literal::String(_)) => Ok(Some(val)),
                _ => Ok(None),
            }
        }
        Inst::ObjectNot { val } => match m.literal(val) {
            Some(x) => {
                let x = Literal::Bool(!x.is_truthy());
                Ok(Some(m.const_(x)?))
            }
            None => Ok(None),
        },
        Inst::StringAdd { lhs, rhs } => {
            let Inst::AllocString { val } = m.inst(lhs) else {
                return Ok(None);
            };
            match (m.literal(val), m.literal(rhs)) {
                (Some(Literal::String(a)), Some(Literal::String(b))) => {
                    let s = format!("{a}{b}");
                    fresh_string(m, iidx, &s).map(Some)
                }
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// Insert, before `iidx`, an instruction allocating a fresh copy of the string `s`.
fn fresh_string(m: &mut Module, iidx: InstIdx, s: &str) -> Result<InstIdx, CompilationError> {
    let val = m.const_(Literal::String(s.into()))?;
    m.insert_before(iidx, Inst::AllocString { val })
}

/// Evaluate the fixnum operation `op` on `a` and `b`, returning `None` if the result overflows the
/// host's fixnum range or the operation can not be evaluated at compile time.
pub(crate) fn eval_fixnum(config: &JitConfig, op: FixnumOp, a: i64, b: i64) -> Option<Literal> {
    let fixnum = |x: Option<i64>| {
        x.filter(|x| config.fixnum_fits(*x))
            .map(Literal::Fixnum)
    };
    match op {
        FixnumOp::Add => fixnum(a.checked_add(b)),
        FixnumOp::Sub => fixnum(a.checked_sub(b)),
        FixnumOp::Mul => fixnum(a.checked_mul(b)),
        FixnumOp::Div => {
            let q = a.checked_div(b)?;
            // Division floors rather than truncates.
            if a % b != 0 && ((a < 0) != (b < 0)) {
                fixnum(q.checked_sub(1))
            } else {
                fixnum(Some(q))
            }
        }
        FixnumOp::Mod => {
            let r = a.checked_rem(b)?;
            // The result has the sign of the divisor.
            if r != 0 && ((r < 0) != (b < 0)) {
                fixnum(Some(r + b))
            } else {
                fixnum(Some(r))
            }
        }
        FixnumOp::Eq => Some(Literal::Bool(a == b)),
        FixnumOp::Ne => Some(Literal::Bool(a != b)),
        FixnumOp::Lt => Some(Literal::Bool(a < b)),
        FixnumOp::Le => Some(Literal::Bool(a <= b)),
        FixnumOp::Gt => Some(Literal::Bool(a > b)),
        FixnumOp::Ge => Some(Literal::Bool(a >= b)),
        FixnumOp::And => Some(Literal::Fixnum(a & b)),
        FixnumOp::Or => Some(Literal::Fixnum(a | b)),
        FixnumOp::Xor => Some(Literal::Fixnum(a ^ b)),
        FixnumOp::Lshift => {
            let sh = u32::try_from(b).ok().filter(|x| *x < 64)?;
            let x = a.checked_shl(sh)?;
            if x >> sh == a {
                fixnum(Some(x))
            } else {
                None
            }
        }
        FixnumOp::Rshift => {
            let sh = u32::try_from(b).ok().filter(|x| *x < 64)?;
            Some(Literal::Fixnum(a >> sh))
        }
    }
}

fn eval_float(op: FloatOp, a: f64, b: f64) -> Literal {
    match op {
        FloatOp::Add => Literal::float(a + b),
        FloatOp::Sub => Literal::float(a - b),
        FloatOp::Mul => Literal::float(a * b),
        FloatOp::Div => Literal::float(a / b),
        FloatOp::Mod => {
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                Literal::float(r + b)
            } else {
                Literal::float(r)
            }
        }
        FloatOp::Eq => Literal::Bool(a == b),
        FloatOp::Ne => Literal::Bool(a != b),
        FloatOp::Lt => Literal::Bool(a < b),
        FloatOp::Le => Literal::Bool(a <= b),
        FloatOp::Gt => Literal::Bool(a > b),
        FloatOp::Ge => Literal::Bool(a >= b),
    }
}
