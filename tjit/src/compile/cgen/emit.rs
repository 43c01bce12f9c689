//! Lower a trace's IR to a C translation unit.

use crate::compile::{
    ir::{ArgsIdx, Inst, InstIdx, Module, SnapshotIdx},
    CompilationError,
};
use std::fmt::{self, Write};

/// The part of every translation unit that does not depend on the trace. The `RuntimeTable`
/// struct must mirror [crate::host::RuntimeTable] field for field.
const PRELUDE: &str = "\
#include <stddef.h>
#include <stdint.h>

typedef uint64_t VALUE;

typedef struct {
    VALUE (*stack_load)(void *, uint32_t);
    void (*stack_restore)(void *, uint32_t, uint32_t, uint32_t, const VALUE *);
    VALUE (*env_load)(void *, uint32_t, uint32_t);
    void (*env_store)(void *, uint32_t, uint32_t, VALUE);
    VALUE (*load_self)(void *);
    uint8_t (*guard_type)(void *, VALUE, uint32_t);
    uint8_t (*truthy)(void *, VALUE);
    uint8_t (*method_cache_valid)(void *, uint32_t, VALUE);
    uint8_t (*method_unredefined)(void *, uint32_t, uint32_t);
    uint8_t (*property_valid)(void *, VALUE, uint32_t, uint32_t);
    uint8_t (*fixnum_op)(void *, uint32_t, VALUE, VALUE, VALUE *);
    VALUE (*float_op)(void *, uint32_t, VALUE, VALUE);
    VALUE (*convert)(void *, uint32_t, VALUE);
    VALUE (*object_not)(void *, VALUE);
    VALUE (*string_add)(void *, VALUE, VALUE);
    VALUE (*alloc_string)(void *, VALUE);
    VALUE (*alloc_array)(void *, uint32_t, const VALUE *);
    VALUE (*alloc_hash)(void *, uint32_t, const VALUE *);
    VALUE (*alloc_range)(void *, VALUE, VALUE, uint8_t);
    VALUE (*get_property)(void *, VALUE, uint32_t);
    void (*set_property)(void *, VALUE, uint32_t, VALUE);
    VALUE (*get_global)(void *, uint32_t);
    void (*set_global)(void *, uint32_t, VALUE);
    uint8_t (*invoke_method)(void *, uint32_t, uint32_t, const VALUE *, VALUE *);
    void (*frame_push)(void *, uint32_t, size_t, uint32_t, const VALUE *);
    void (*frame_pop)(void *);
} RuntimeTable;

typedef struct {
    uint32_t idx;
    size_t pc;
} ExitRecord;

typedef struct {
    const VALUE *consts;
    const ExitRecord *exits;
} TraceInfo;

static const RuntimeTable *rt;
static const VALUE *consts;
static const ExitRecord *exits;
";

/// The name of the function which initialises the trace `m`.
pub(super) fn init_sym(m: &Module) -> String {
    format!("init_trace_{}", m.trace_id())
}

/// The name of the function which executes the trace `m`.
pub(super) fn trace_sym(m: &Module) -> String {
    format!("trace_{}", m.trace_id())
}

pub(super) fn emit(m: &Module) -> Result<String, CompilationError> {
    let mut out = String::new();
    emit_into(m, &mut out)
        .map_err(|e| CompilationError::InternalError(format!("writing C source: {e}")))?;
    Ok(out)
}

fn emit_into(m: &Module, out: &mut String) -> fmt::Result {
    out.push_str(PRELUDE);
    writeln!(
        out,
        "\nvoid {}(const RuntimeTable *r, const TraceInfo *info) {{",
        init_sym(m)
    )?;
    writeln!(out, "    rt = r;\n    consts = info->consts;\n    exits = info->exits;\n}}")?;
    writeln!(out, "\nconst ExitRecord *{}(void *ctx) {{", trace_sym(m))?;
    let order = m.program_order();
    let defs = order
        .iter()
        .filter(|x| m.inst(**x).defines_value())
        .map(|x| format!("v{x}"))
        .collect::<Vec<_>>();
    if !defs.is_empty() {
        writeln!(out, "    VALUE {};", defs.join(", "))?;
    }
    for bidx in m.blocks() {
        writeln!(out, "bb{bidx}:")?;
        for iidx in m.block(bidx).insts() {
            writeln!(out, "    {}", c_inst(m, *iidx))?;
        }
    }
    for (i, s) in m.snapshots.iter().enumerate() {
        writeln!(out, "exit_{i}:")?;
        for (from_top, frame) in s.exit_plan().frames_from_top() {
            writeln!(
                out,
                "    rt->stack_restore(ctx, {from_top}, {}, {}, {});",
                frame.consumed,
                frame.vals.len(),
                c_array(&frame.vals)
            )?;
        }
        writeln!(out, "    return &exits[{i}];")?;
    }
    writeln!(out, "}}")
}

/// A C expression for a `const VALUE *` pointing at the values of `vals`.
fn c_array(vals: &[InstIdx]) -> String {
    if vals.is_empty() {
        return "NULL".into();
    }
    let vs = vals
        .iter()
        .map(|x| format!("v{x}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("(const VALUE[]){{{vs}}}")
}

fn c_args(m: &Module, args: ArgsIdx, num: u32) -> String {
    c_array(m.args(args, num))
}

fn goto_exit(exit: SnapshotIdx) -> String {
    format!("goto exit_{exit};")
}

/// Return the C statement(s) for the instruction `iidx`.
fn c_inst(m: &Module, iidx: InstIdx) -> String {
    let d = format!("v{iidx}");
    match m.inst(iidx) {
        Inst::Tombstone => String::new(),
        Inst::LoadConst(c) => format!("{d} = consts[{c}];"),
        Inst::LoadSelf => format!("{d} = rt->load_self(ctx);"),
        Inst::StackLoad { depth } => format!("{d} = rt->stack_load(ctx, {depth});"),
        Inst::EnvLoad { level, idx } => format!("{d} = rt->env_load(ctx, {level}, {idx});"),
        Inst::EnvStore { level, idx, val } => {
            format!("rt->env_store(ctx, {level}, {idx}, v{val});")
        }
        Inst::GuardType { ty, val, exit } => format!(
            "if (!rt->guard_type(ctx, v{val}, {})) {}",
            ty as u32,
            goto_exit(exit)
        ),
        Inst::Guard { cond, expect, exit } => format!(
            "if (rt->truthy(ctx, v{cond}) != {}) {}",
            u8::from(expect),
            goto_exit(exit)
        ),
        Inst::GuardMethodCache { site, recv, exit } => format!(
            "if (!rt->method_cache_valid(ctx, {}, v{recv})) {}",
            site.0,
            goto_exit(exit)
        ),
        Inst::GuardMethodRedefine { ty, op, exit } => format!(
            "if (!rt->method_unredefined(ctx, {}, {})) {}",
            ty as u32,
            op.to_u32(),
            goto_exit(exit)
        ),
        Inst::GuardProperty {
            recv,
            name,
            index,
            exit,
        } => format!(
            "if (!rt->property_valid(ctx, v{recv}, {}, {index})) {}",
            name.0,
            goto_exit(exit)
        ),
        Inst::FixnumArith { op, lhs, rhs, exit } => format!(
            "if (rt->fixnum_op(ctx, {}, v{lhs}, v{rhs}, &{d})) {}",
            op as u32,
            goto_exit(exit)
        ),
        Inst::FixnumBinop { op, lhs, rhs } => {
            format!("rt->fixnum_op(ctx, {}, v{lhs}, v{rhs}, &{d});", op as u32)
        }
        Inst::FloatBinop { op, lhs, rhs } => {
            format!("{d} = rt->float_op(ctx, {}, v{lhs}, v{rhs});", op as u32)
        }
        Inst::Convert { op, val } => format!("{d} = rt->convert(ctx, {}, v{val});", op as u32),
        Inst::ObjectNot { val } => format!("{d} = rt->object_not(ctx, v{val});"),
        Inst::StringAdd { lhs, rhs } => format!("{d} = rt->string_add(ctx, v{lhs}, v{rhs});"),
        Inst::AllocString { val } => format!("{d} = rt->alloc_string(ctx, v{val});"),
        Inst::AllocArray { args, num } => format!(
            "{d} = rt->alloc_array(ctx, {num}, {});",
            c_args(m, args, num)
        ),
        Inst::AllocHash { args, num } => format!(
            "{d} = rt->alloc_hash(ctx, {num}, {});",
            c_args(m, args, num)
        ),
        Inst::AllocRange {
            low,
            high,
            exclusive,
        } => format!(
            "{d} = rt->alloc_range(ctx, v{low}, v{high}, {});",
            u8::from(exclusive)
        ),
        Inst::GetProperty { recv, index } => {
            format!("{d} = rt->get_property(ctx, v{recv}, {index});")
        }
        Inst::SetProperty { recv, index, val } => {
            format!("rt->set_property(ctx, v{recv}, {index}, v{val});")
        }
        Inst::GetGlobal { name } => format!("{d} = rt->get_global(ctx, {});", name.0),
        Inst::SetGlobal { name, val } => format!("rt->set_global(ctx, {}, v{val});", name.0),
        Inst::InvokeMethod {
            site,
            args,
            num,
            exit,
        } => format!(
            "if (rt->invoke_method(ctx, {}, {num}, {}, &{d})) {}",
            site.0,
            c_args(m, args, num),
            goto_exit(exit)
        ),
        Inst::FramePush {
            method,
            return_pc,
            args,
            num,
        } => format!(
            "rt->frame_push(ctx, {}, {}, {num}, {});",
            method.0,
            return_pc.0,
            c_args(m, args, num)
        ),
        Inst::FramePop => "rt->frame_pop(ctx);".into(),
        Inst::Jump { target } => format!("goto bb{target};"),
        Inst::Exit { exit } => goto_exit(exit),
    }
}
