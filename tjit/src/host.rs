//! The interface between tjit and the interpreter it is attached to.
//!
//! The interpreter ("host") hands tjit one decoded [Insn] per step together with a [Frame] which
//! lets tjit inspect interpreter state (and materialise constants) at record time. At run time,
//! compiled traces talk to the host exclusively through the function pointers in a
//! [RuntimeTable].
//!
//! tjit never interprets the bits of a [Value] itself: everything it needs to know about a value
//! is asked of the host. The only semantic assumptions tjit makes are those it needs for constant
//! folding:
//!
//!   * fixnums are two's complement integers of [crate::JitConfig::fixnum_bits] bits, with floored
//!     division and modulo, which overflow (rather than wrap) outside that range;
//!   * floats are IEEE 754 doubles;
//!   * only `nil` and `false` are falsy.

use std::{ffi::c_void, fmt};
use static_assertions::{assert_eq_size, const_assert_eq};
use strum::{Display, FromRepr};

/// A bytecode address. These must be unique across the whole program (not just within a single
/// method) and, within a method, numerically increasing in bytecode order: a branch is "backward"
/// precisely when its target is numerically smaller than its own address.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pc(pub usize);

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An opaque, machine-word sized, host value.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Value(pub u64);

const_assert_eq!(std::mem::size_of::<Value>(), 8);

/// An opaque host handle identifying a call site (and thus its inline cache).
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CallSite(pub u32);

/// An opaque host handle identifying a bytecode method.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MethodId(pub u32);

/// An opaque host handle identifying a name (of an instance variable, global, ...).
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Symbol(pub u32);

/// The dynamic type of a value, as far as tjit cares. Passed to the host as a `u32`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum ValueType {
    Nil,
    True,
    False,
    Fixnum,
    Float,
    String,
    Symbol,
    Array,
    Hash,
    Range,
    Object,
}

/// A literal value embedded in a trace.
///
/// Two literals are equal iff they are bit-identical: floats are compared by their bit pattern
/// (so `0.0 != -0.0`) and host objects by identity.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Literal {
    Nil,
    Bool(bool),
    Fixnum(i64),
    /// A float, stored as its bit pattern.
    Float(u64),
    String(Box<str>),
    /// A host object whose contents tjit knows nothing about.
    Object(Value, ValueType),
}

impl Literal {
    pub fn float(f: f64) -> Self {
        Literal::Float(f.to_bits())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Literal::Nil => ValueType::Nil,
            Literal::Bool(true) => ValueType::True,
            Literal::Bool(false) => ValueType::False,
            Literal::Fixnum(_) => ValueType::Fixnum,
            Literal::Float(_) => ValueType::Float,
            Literal::String(_) => ValueType::String,
            Literal::Object(_, ty) => *ty,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Literal::Nil | Literal::Bool(false))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => write!(f, "nil"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Fixnum(x) => write!(f, "{x}"),
            Literal::Float(x) => write!(f, "{:?}", f64::from_bits(*x)),
            Literal::String(s) => write!(f, "{s:?}"),
            Literal::Object(v, ty) => write!(f, "{ty}@{:#x}", v.0),
        }
    }
}

/// The binary operators with a fast path in the bytecode.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum BinopKind {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Ltlt,
    Rshift,
    And,
    Or,
    Xor,
}

/// The unary operators with a fast path in the bytecode.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum UnopKind {
    Succ,
    Not,
}

/// A redefinable basic operation, as passed to [RuntimeTable::method_unredefined].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BasicOp {
    Binop(BinopKind),
    Unop(UnopKind),
}

impl BasicOp {
    /// The numeric encoding passed to the host: binary operators are their discriminant,
    /// unary operators are offset by 256.
    pub fn to_u32(self) -> u32 {
        match self {
            BasicOp::Binop(x) => x as u32,
            BasicOp::Unop(x) => 256 + x as u32,
        }
    }
}

impl fmt::Display for BasicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasicOp::Binop(x) => write!(f, "{x}"),
            BasicOp::Unop(x) => write!(f, "{x}"),
        }
    }
}

/// A fixnum operation, as passed to [RuntimeTable::fixnum_op].
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FixnumOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
    Lshift,
    Rshift,
}

impl FixnumOp {
    pub(crate) fn from_binop(op: BinopKind) -> Self {
        match op {
            BinopKind::Plus => FixnumOp::Add,
            BinopKind::Minus => FixnumOp::Sub,
            BinopKind::Mult => FixnumOp::Mul,
            BinopKind::Div => FixnumOp::Div,
            BinopKind::Mod => FixnumOp::Mod,
            BinopKind::Eq => FixnumOp::Eq,
            BinopKind::Neq => FixnumOp::Ne,
            BinopKind::Lt => FixnumOp::Lt,
            BinopKind::Le => FixnumOp::Le,
            BinopKind::Gt => FixnumOp::Gt,
            BinopKind::Ge => FixnumOp::Ge,
            BinopKind::Ltlt => FixnumOp::Lshift,
            BinopKind::Rshift => FixnumOp::Rshift,
            BinopKind::And => FixnumOp::And,
            BinopKind::Or => FixnumOp::Or,
            BinopKind::Xor => FixnumOp::Xor,
        }
    }

    /// Can this operation overflow (or divide by zero)?
    pub fn can_overflow(self) -> bool {
        matches!(
            self,
            FixnumOp::Add
                | FixnumOp::Sub
                | FixnumOp::Mul
                | FixnumOp::Div
                | FixnumOp::Mod
                | FixnumOp::Lshift
        )
    }

    /// Does this operation produce a boolean?
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            FixnumOp::Eq | FixnumOp::Ne | FixnumOp::Lt | FixnumOp::Le | FixnumOp::Gt | FixnumOp::Ge
        )
    }
}

/// A float operation, as passed to [RuntimeTable::float_op].
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FloatOp {
    pub(crate) fn from_binop(op: BinopKind) -> Option<Self> {
        Some(match op {
            BinopKind::Plus => FloatOp::Add,
            BinopKind::Minus => FloatOp::Sub,
            BinopKind::Mult => FloatOp::Mul,
            BinopKind::Div => FloatOp::Div,
            BinopKind::Mod => FloatOp::Mod,
            BinopKind::Eq => FloatOp::Eq,
            BinopKind::Neq => FloatOp::Ne,
            BinopKind::Lt => FloatOp::Lt,
            BinopKind::Le => FloatOp::Le,
            BinopKind::Gt => FloatOp::Gt,
            BinopKind::Ge => FloatOp::Ge,
            _ => return None,
        })
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            FloatOp::Eq | FloatOp::Ne | FloatOp::Lt | FloatOp::Le | FloatOp::Gt | FloatOp::Ge
        )
    }
}

/// A conversion, as passed to [RuntimeTable::convert].
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum ConvOp {
    FixnumToFloat,
    FixnumToString,
    FloatToString,
    /// Call `to_s` on an arbitrary object.
    ObjectToString,
}

/// A decoded bytecode instruction, as seen by tjit.
#[derive(Clone, Debug, PartialEq)]
pub enum Insn {
    Nop,
    GetLocal { level: u32, idx: u32 },
    SetLocal { level: u32, idx: u32 },
    GetInstanceVariable { name: Symbol },
    SetInstanceVariable { name: Symbol },
    GetGlobal { name: Symbol },
    SetGlobal { name: Symbol },
    PutNil,
    PutSelf,
    PutObject(Value),
    PutString(Value),
    ConcatStrings(u32),
    ToString,
    NewArray(u32),
    NewHash(u32),
    NewRange { exclusive: bool },
    Pop,
    Dup,
    DupN(u32),
    Swap,
    TopN(u32),
    SetN(u32),
    AdjustStack(u32),
    /// Call the method resolved at `site` on a receiver with `argc` arguments above it. `next` is
    /// the address execution continues at when the callee returns.
    Send { site: CallSite, argc: u32, next: Pc },
    Leave,
    Throw,
    Jump { target: Pc },
    BranchIf { target: Pc, next: Pc },
    BranchUnless { target: Pc, next: Pc },
    OptBinop { op: BinopKind, site: CallSite },
    OptUnop { op: UnopKind, site: CallSite },
    /// An instruction tjit can not record.
    Other { name: &'static str },
}

impl Insn {
    /// If this instruction transfers control to an address other than the next instruction,
    /// return that address, given the truthiness `cond` of the top of the stack.
    pub fn branch_target(&self, cond: impl FnOnce() -> bool) -> Option<Pc> {
        match self {
            Insn::Jump { target } => Some(*target),
            Insn::BranchIf { target, .. } => cond().then_some(*target),
            Insn::BranchUnless { target, .. } => (!cond()).then_some(*target),
            _ => None,
        }
    }
}

/// A builtin method tjit can lower to a dedicated instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Builtin {
    /// `!`
    ObjectNot,
}

/// What a call site resolves to for a given receiver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallTarget {
    /// A method implemented in bytecode: it can be inlined into a trace.
    Bytecode { method: MethodId, entry: Pc },
    /// A method that reads the instance variable `name`.
    AttrReader { name: Symbol },
    /// A method that writes its only argument to the instance variable `name`.
    AttrWriter { name: Symbol },
    Builtin(Builtin),
    /// A method implemented natively by the host.
    Native,
    /// The call can not be resolved (e.g. the method does not exist).
    Unknown,
}

/// The interpreter's current frame and object model, as seen by tjit while it records and runs
/// traces.
pub trait Frame {
    /// How many values are on the current frame's operand stack?
    fn stack_len(&self) -> usize;
    /// The value `n` slots below the top of the operand stack (`0` is the top).
    fn topn(&self, n: usize) -> Value;
    fn self_value(&self) -> Value;
    fn value_type(&self, v: Value) -> ValueType;
    fn is_truthy(&self, v: Value) -> bool;
    /// Describe `v` as a literal. Values with no better description are [Literal::Object]s.
    fn literal(&self, v: Value) -> Literal;
    /// Create (or find) the host value for `lit`. The host must keep the value alive for as long
    /// as the [crate::JitEngine] exists.
    fn materialize(&mut self, lit: &Literal) -> Value;
    /// Resolve the call at `site` for receiver `recv` as the interpreter would right now.
    fn resolve_call(&self, site: CallSite, recv: Value) -> CallTarget;
    /// If `obj` has a cached slot for the instance variable `name`, return its index.
    fn ivar_index(&self, obj: Value, name: Symbol) -> Option<u32>;
    /// The pointer handed back to the host as the `ctx` argument of every [RuntimeTable] function
    /// while a trace executes.
    fn native_ctx(&mut self) -> *mut c_void;
}

pub type Ctx = *mut c_void;

/// The run-time support functions a host provides to compiled traces.
///
/// Functions returning `u8` return `1` for "true/success" and `0` otherwise, with the exception
/// of [Self::fixnum_op] and [Self::invoke_method] which return `0` on success and non-zero on
/// failure (overflow, division by zero, or a raised error). The field order of this struct is part of the ABI: the C prelude emitted by the code
/// generator mirrors it exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RuntimeTable {
    /// Read the value `depth` slots below the top of the current frame's operand stack.
    pub stack_load: unsafe extern "C" fn(ctx: Ctx, depth: u32) -> Value,
    /// In the frame `frame_from_top` frames below the current one (`0` is the current frame),
    /// pop `consumed` values from the operand stack, then push the `n` values in `vals`.
    pub stack_restore:
        unsafe extern "C" fn(
            ctx: Ctx,
            frame_from_top: u32,
            consumed: u32,
            n: u32,
            vals: *const Value,
        ),
    pub env_load: unsafe extern "C" fn(ctx: Ctx, level: u32, idx: u32) -> Value,
    pub env_store: unsafe extern "C" fn(ctx: Ctx, level: u32, idx: u32, val: Value),
    pub load_self: unsafe extern "C" fn(ctx: Ctx) -> Value,
    /// Is `val` of the [ValueType] `ty`?
    pub guard_type: unsafe extern "C" fn(ctx: Ctx, val: Value, ty: u32) -> u8,
    pub truthy: unsafe extern "C" fn(ctx: Ctx, val: Value) -> u8,
    /// Would `site` still dispatch to the same method for `recv`?
    pub method_cache_valid: unsafe extern "C" fn(ctx: Ctx, site: u32, recv: Value) -> u8,
    /// Is the basic operation `op` (see [BasicOp::to_u32]) on [ValueType] `ty` still the builtin?
    pub method_unredefined: unsafe extern "C" fn(ctx: Ctx, ty: u32, op: u32) -> u8,
    /// Is the instance variable `name` of `recv` still stored at slot `index`?
    pub property_valid: unsafe extern "C" fn(ctx: Ctx, recv: Value, name: u32, index: u32) -> u8,
    /// Perform the fixnum operation `op` (a [FixnumOp]), writing the result to `out`. Comparisons
    /// produce host booleans.
    pub fixnum_op:
        unsafe extern "C" fn(ctx: Ctx, op: u32, lhs: Value, rhs: Value, out: *mut Value) -> u8,
    /// Perform the float operation `op` (a [FloatOp]).
    pub float_op: unsafe extern "C" fn(ctx: Ctx, op: u32, lhs: Value, rhs: Value) -> Value,
    /// Perform the conversion `op` (a [ConvOp]).
    pub convert: unsafe extern "C" fn(ctx: Ctx, op: u32, val: Value) -> Value,
    pub object_not: unsafe extern "C" fn(ctx: Ctx, val: Value) -> Value,
    pub string_add: unsafe extern "C" fn(ctx: Ctx, lhs: Value, rhs: Value) -> Value,
    /// Allocate a fresh copy of the string `val`.
    pub alloc_string: unsafe extern "C" fn(ctx: Ctx, val: Value) -> Value,
    pub alloc_array: unsafe extern "C" fn(ctx: Ctx, n: u32, vals: *const Value) -> Value,
    /// Allocate a hash from `n` values laid out as alternating keys and values.
    pub alloc_hash: unsafe extern "C" fn(ctx: Ctx, n: u32, vals: *const Value) -> Value,
    pub alloc_range:
        unsafe extern "C" fn(ctx: Ctx, low: Value, high: Value, exclusive: u8) -> Value,
    pub get_property: unsafe extern "C" fn(ctx: Ctx, recv: Value, index: u32) -> Value,
    pub set_property: unsafe extern "C" fn(ctx: Ctx, recv: Value, index: u32, val: Value),
    pub get_global: unsafe extern "C" fn(ctx: Ctx, name: u32) -> Value,
    pub set_global: unsafe extern "C" fn(ctx: Ctx, name: u32, val: Value),
    /// Call the method resolved at `site`, writing its result to `out`. `argv[0]` is the
    /// receiver. If the method raises, the error is discarded and non-zero is returned: the trace
    /// then exits so that the interpreter re-executes the call and raises the error itself.
    pub invoke_method: unsafe extern "C" fn(
        ctx: Ctx,
        site: u32,
        argc: u32,
        argv: *const Value,
        out: *mut Value,
    ) -> u8,
    /// Push an interpreter frame for `method` as if it had been called by the current frame,
    /// which resumes at `return_pc` when the new frame is popped. `argv[0]` is the receiver. The
    /// caller's operand stack must be left untouched.
    pub frame_push:
        unsafe extern "C" fn(
            ctx: Ctx,
            method: u32,
            return_pc: usize,
            argc: u32,
            argv: *const Value,
        ),
    /// Pop the current interpreter frame, discarding its operand stack.
    pub frame_pop: unsafe extern "C" fn(ctx: Ctx),
}

assert_eq_size!(RuntimeTable, [usize; 26]);
