//! Methods implemented natively by the VM, and the arithmetic shared by those methods and the
//! runtime functions compiled traces call.

use super::{value::*, Vm};
use tjit::host::{FixnumOp, FloatOp, Value};

/// A native method: called with the method name and `argv`, where `argv[0]` is the receiver.
pub(super) type NativeFn = fn(&mut Vm, &str, &[Value]) -> Result<Value, String>;

/// The native method `name` of `class`, if there is one.
pub(super) fn lookup(class: ClassId, name: &str) -> Option<NativeFn> {
    let f: NativeFn = match (class, name) {
        (INTEGER, "succ") => integer_succ,
        (INTEGER, "to_f") => integer_to_f,
        (INTEGER, _) if fixnum_op(name).is_some() => integer_binop,
        (FLOAT, "to_i") => float_to_i,
        (FLOAT, _) if float_op(name).is_some() => float_binop,
        (STRING, "+") => string_plus,
        (STRING, "<<") => string_append,
        (STRING, "size" | "length") => string_size,
        (STRING, "<" | "<=" | ">" | ">=") => string_compare,
        (ARRAY, "[]") => array_get,
        (ARRAY, "[]=") => array_set,
        (ARRAY, "<<" | "push") => array_push,
        (ARRAY, "size" | "length") => array_size,
        (HASH, "[]") => hash_get,
        (HASH, "[]=") => hash_set,
        (HASH, "size" | "length") => hash_size,
        (RANGE, "first" | "last") => range_bound,
        (CLASS, "new") => class_new,
        (_, "puts") => puts,
        (_, "print") => print,
        (_, "to_s") => to_s,
        (_, "inspect") => inspect,
        (_, "==" | "!=") => equal,
        (_, "nil?") => is_nil,
        _ => return None,
    };
    Some(f)
}

pub(super) fn fixnum_op(name: &str) -> Option<FixnumOp> {
    Some(match name {
        "+" => FixnumOp::Add,
        "-" => FixnumOp::Sub,
        "*" => FixnumOp::Mul,
        "/" => FixnumOp::Div,
        "%" => FixnumOp::Mod,
        "==" => FixnumOp::Eq,
        "!=" => FixnumOp::Ne,
        "<" => FixnumOp::Lt,
        "<=" => FixnumOp::Le,
        ">" => FixnumOp::Gt,
        ">=" => FixnumOp::Ge,
        "&" => FixnumOp::And,
        "|" => FixnumOp::Or,
        "^" => FixnumOp::Xor,
        "<<" => FixnumOp::Lshift,
        ">>" => FixnumOp::Rshift,
        _ => return None,
    })
}

pub(super) fn float_op(name: &str) -> Option<FloatOp> {
    Some(match name {
        "+" => FloatOp::Add,
        "-" => FloatOp::Sub,
        "*" => FloatOp::Mul,
        "/" => FloatOp::Div,
        "%" => FloatOp::Mod,
        "==" => FloatOp::Eq,
        "!=" => FloatOp::Ne,
        "<" => FloatOp::Lt,
        "<=" => FloatOp::Le,
        ">" => FloatOp::Gt,
        ">=" => FloatOp::Ge,
        _ => return None,
    })
}

/// Perform `op` on two fixnums. Division and modulo floor; results outside the fixnum range are
/// errors rather than wrapping.
pub(super) fn fixnum_arith(op: FixnumOp, a: i64, b: i64) -> Result<Value, &'static str> {
    const OVERFLOW: &str = "integer overflow";
    let x = match op {
        FixnumOp::Add => a.checked_add(b),
        FixnumOp::Sub => a.checked_sub(b),
        FixnumOp::Mul => a.checked_mul(b),
        FixnumOp::Div | FixnumOp::Mod if b == 0 => return Err("divided by 0"),
        FixnumOp::Div => a.checked_div(b).map(|q| {
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }),
        FixnumOp::Mod => a.checked_rem(b).map(|r| {
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }),
        FixnumOp::Eq => return Ok(bool_val(a == b)),
        FixnumOp::Ne => return Ok(bool_val(a != b)),
        FixnumOp::Lt => return Ok(bool_val(a < b)),
        FixnumOp::Le => return Ok(bool_val(a <= b)),
        FixnumOp::Gt => return Ok(bool_val(a > b)),
        FixnumOp::Ge => return Ok(bool_val(a >= b)),
        FixnumOp::And => Some(a & b),
        FixnumOp::Or => Some(a | b),
        FixnumOp::Xor => Some(a ^ b),
        FixnumOp::Lshift => {
            let sh = u32::try_from(b).ok().filter(|x| *x < 64).ok_or(OVERFLOW)?;
            a.checked_shl(sh).filter(|x| x >> sh == a)
        }
        FixnumOp::Rshift => Some(a >> b.clamp(0, 63)),
    };
    x.and_then(fixnum).ok_or(OVERFLOW)
}

impl Vm {
    /// Perform `op` on two floats. Modulo takes the sign of the divisor.
    pub(super) fn float_arith(&mut self, op: FloatOp, a: f64, b: f64) -> Value {
        let x = match op {
            FloatOp::Add => a + b,
            FloatOp::Sub => a - b,
            FloatOp::Mul => a * b,
            FloatOp::Div => a / b,
            FloatOp::Mod => {
                let r = a % b;
                if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                    r + b
                } else {
                    r
                }
            }
            FloatOp::Eq => return bool_val(a == b),
            FloatOp::Ne => return bool_val(a != b),
            FloatOp::Lt => return bool_val(a < b),
            FloatOp::Le => return bool_val(a <= b),
            FloatOp::Gt => return bool_val(a > b),
            FloatOp::Ge => return bool_val(a >= b),
        };
        self.alloc_float(x)
    }

    /// A numeric value as a float.
    fn numeric(&self, v: Value) -> Option<f64> {
        as_fixnum(v).map(|x| x as f64).or_else(|| self.float(v))
    }

    /// `s` followed by `to_s` of `rhs`, as a new string.
    pub(super) fn string_add(&mut self, lhs: Value, rhs: Value) -> Value {
        let mut s = self.to_s(lhs);
        s.push_str(&self.to_s(rhs));
        self.alloc_str(s)
    }
}

fn args<'a, const N: usize>(name: &str, argv: &'a [Value]) -> Result<&'a [Value; N], String> {
    argv.try_into().map_err(|_| {
        format!(
            "wrong number of arguments calling `{name}' (given {}, expected {})",
            argv.len().saturating_sub(1),
            N - 1
        )
    })
}

fn integer_succ(_: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let x = as_fixnum(*recv).ok_or("not an integer")?;
    Ok(fixnum_arith(FixnumOp::Add, x, 1)?)
}

fn integer_to_f(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let x = as_fixnum(*recv).ok_or("not an integer")?;
    Ok(vm.alloc_float(x as f64))
}

fn integer_binop(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [lhs, rhs] = args::<2>(name, argv)?;
    let a = as_fixnum(*lhs).ok_or("not an integer")?;
    if let (Some(b), Some(op)) = (as_fixnum(*rhs), fixnum_op(name)) {
        return Ok(fixnum_arith(op, a, b)?);
    }
    if let (Some(b), Some(op)) = (vm.float(*rhs), float_op(name)) {
        return Ok(vm.float_arith(op, a as f64, b));
    }
    match name {
        "==" => Ok(QFALSE),
        "!=" => Ok(QTRUE),
        _ => Err(format!(
            "{} can't be coerced into Integer",
            vm.class_name(*rhs)
        )),
    }
}

fn float_to_i(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let x = vm.float(*recv).ok_or("not a float")?;
    Ok(float_to_fixnum(x))
}

/// Truncate `x` to a fixnum, or `nil` if it has no fixnum representation.
pub(super) fn float_to_fixnum(x: f64) -> Value {
    let x = x.trunc();
    if x.is_finite() && (x as i64) as f64 == x {
        fixnum(x as i64).unwrap_or(QNIL)
    } else {
        QNIL
    }
}

fn float_binop(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [lhs, rhs] = args::<2>(name, argv)?;
    let a = vm.numeric(*lhs).ok_or("not a float")?;
    match (vm.numeric(*rhs), float_op(name)) {
        (Some(b), Some(op)) => Ok(vm.float_arith(op, a, b)),
        (None, Some(FloatOp::Eq)) => Ok(QFALSE),
        (None, Some(FloatOp::Ne)) => Ok(QTRUE),
        _ => Err(format!("{} can't be coerced into Float", vm.class_name(*rhs))),
    }
}

fn string_plus(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [lhs, rhs] = args::<2>(name, argv)?;
    Ok(vm.string_add(*lhs, *rhs))
}

fn string_append(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [lhs, rhs] = args::<2>(name, argv)?;
    let s = vm.to_s(*rhs);
    if let Some(Obj::Str(x)) = vm.obj_mut(*lhs) {
        x.push_str(&s);
    }
    Ok(*lhs)
}

fn string_size(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let n = vm.str(*recv).map_or(0, |s| s.chars().count());
    Ok(fixnum(n as i64).unwrap_or(QNIL))
}

fn string_compare(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [lhs, rhs] = args::<2>(name, argv)?;
    let (Some(a), Some(b)) = (vm.str(*lhs), vm.str(*rhs)) else {
        return Err(format!(
            "comparison of String with {} failed",
            vm.inspect(*rhs)
        ));
    };
    Ok(bool_val(match name {
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        _ => a >= b,
    }))
}

/// Resolve a possibly negative index into a sequence of length `len`.
fn index(v: Value, len: usize) -> Result<Option<usize>, String> {
    let i = as_fixnum(v).ok_or("no implicit conversion into Integer")?;
    let i = if i < 0 { i + len as i64 } else { i };
    Ok(usize::try_from(i).ok())
}

fn array_get(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv, idx] = args::<2>(name, argv)?;
    let Some(Obj::Array(xs)) = vm.obj(*recv) else {
        return Ok(QNIL);
    };
    Ok(index(*idx, xs.len())?
        .and_then(|i| xs.get(i).copied())
        .unwrap_or(QNIL))
}

fn array_set(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv, idx, val] = args::<3>(name, argv)?;
    if let Some(Obj::Array(xs)) = vm.obj_mut(*recv) {
        let i = index(*idx, xs.len())?.ok_or("index out of array")?;
        if xs.len() <= i {
            xs.resize(i + 1, QNIL);
        }
        xs[i] = *val;
    }
    Ok(*val)
}

fn array_push(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv, val] = args::<2>(name, argv)?;
    if let Some(Obj::Array(xs)) = vm.obj_mut(*recv) {
        xs.push(*val);
    }
    Ok(*recv)
}

fn array_size(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let n = match vm.obj(*recv) {
        Some(Obj::Array(xs)) => xs.len(),
        _ => 0,
    };
    Ok(fixnum(n as i64).unwrap_or(QNIL))
}

fn hash_get(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv, key] = args::<2>(name, argv)?;
    let Some(Obj::Hash(kvs)) = vm.obj(*recv) else {
        return Ok(QNIL);
    };
    Ok(kvs
        .iter()
        .find(|(k, _)| vm.values_eq(*k, *key))
        .map_or(QNIL, |(_, v)| *v))
}

fn hash_set(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv, key, val] = args::<3>(name, argv)?;
    let i = match vm.obj(*recv) {
        Some(Obj::Hash(kvs)) => kvs.iter().position(|(k, _)| vm.values_eq(*k, *key)),
        _ => return Ok(*val),
    };
    if let Some(Obj::Hash(kvs)) = vm.obj_mut(*recv) {
        match i {
            Some(i) => kvs[i].1 = *val,
            None => kvs.push((*key, *val)),
        }
    }
    Ok(*val)
}

fn hash_size(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let n = match vm.obj(*recv) {
        Some(Obj::Hash(kvs)) => kvs.len(),
        _ => 0,
    };
    Ok(fixnum(n as i64).unwrap_or(QNIL))
}

fn range_bound(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    Ok(match vm.obj(*recv) {
        Some(Obj::Range { low, .. }) if name == "first" => *low,
        Some(Obj::Range { high, .. }) => *high,
        _ => QNIL,
    })
}

fn class_new(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let class = match vm.obj(*recv) {
        Some(Obj::Class(c)) if *c == OBJECT || *c >= BUILTIN_CLASSES.len() => *c,
        _ => return Err(format!("can't instantiate {}", vm.to_s(*recv))),
    };
    Ok(vm.alloc(Obj::Object {
        class,
        ivars: Vec::new(),
    }))
}

fn puts(vm: &mut Vm, _: &str, argv: &[Value]) -> Result<Value, String> {
    if argv.len() == 1 {
        vm.output.push('\n');
    }
    for x in &argv[1..] {
        let s = vm.to_s(*x);
        vm.output.push_str(&s);
        if !s.ends_with('\n') {
            vm.output.push('\n');
        }
    }
    Ok(QNIL)
}

fn print(vm: &mut Vm, _: &str, argv: &[Value]) -> Result<Value, String> {
    for x in &argv[1..] {
        let s = vm.to_s(*x);
        vm.output.push_str(&s);
    }
    Ok(QNIL)
}

fn to_s(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    Ok(vm.object_to_string(*recv))
}

fn inspect(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    let s = vm.inspect(*recv);
    Ok(vm.alloc_str(s))
}

fn equal(vm: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [lhs, rhs] = args::<2>(name, argv)?;
    let eq = vm.values_eq(*lhs, *rhs);
    Ok(bool_val(if name == "==" { eq } else { !eq }))
}

fn is_nil(_: &mut Vm, name: &str, argv: &[Value]) -> Result<Value, String> {
    let [recv] = args::<1>(name, argv)?;
    Ok(bool_val(*recv == QNIL))
}

#[cfg(test)]
mod test {
    use super::*;

    fn fix(x: i64) -> Value {
        fixnum(x).unwrap()
    }

    #[test]
    fn floored_division() {
        assert_eq!(fixnum_arith(FixnumOp::Div, -7, 2), Ok(fix(-4)));
        assert_eq!(fixnum_arith(FixnumOp::Mod, -7, 2), Ok(fix(1)));
        assert_eq!(fixnum_arith(FixnumOp::Mod, 7, -2), Ok(fix(-1)));
        assert_eq!(fixnum_arith(FixnumOp::Div, 7, 0), Err("divided by 0"));
    }

    #[test]
    fn overflow() {
        let max = i64::MAX >> 1;
        assert_eq!(fixnum_arith(FixnumOp::Add, max, 1), Err("integer overflow"));
        assert_eq!(fixnum_arith(FixnumOp::Sub, max, 1), Ok(fix(max - 1)));
        assert_eq!(fixnum_arith(FixnumOp::Lshift, 1, 62), Err("integer overflow"));
        assert_eq!(fixnum_arith(FixnumOp::Lshift, 1, 61), Ok(fix(1 << 61)));
        assert_eq!(fixnum_arith(FixnumOp::Rshift, -8, 100), Ok(fix(-1)));
    }

    #[test]
    fn compares_are_booleans() {
        assert_eq!(fixnum_arith(FixnumOp::Lt, 1, 2), Ok(QTRUE));
        assert_eq!(fixnum_arith(FixnumOp::Ge, 1, 2), Ok(QFALSE));
    }

    #[test]
    fn dispatch() {
        assert!(lookup(INTEGER, "+").is_some());
        assert!(lookup(INTEGER, "to_i").is_none());
        assert!(lookup(STRING, "puts").is_some());
        assert!(lookup(FLOAT, "<<").is_none());
        assert!(lookup(OBJECT, "!").is_none());
    }
}
