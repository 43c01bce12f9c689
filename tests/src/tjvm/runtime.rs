//! The runtime support functions compiled traces call back into. `ctx` is always the [Vm] that
//! handed it out through [tjit::host::Frame::native_ctx].

use super::{
    native::fixnum_arith,
    value::*,
    Vm,
};
use std::slice;
use tjit::host::{
    CallSite, ConvOp, Ctx, FixnumOp, FloatOp, MethodId, RuntimeTable, Symbol, Value, ValueType,
};

unsafe fn vm<'a>(ctx: Ctx) -> &'a mut Vm {
    unsafe { &mut *ctx.cast::<Vm>() }
}

unsafe fn values<'a>(vals: *const Value, n: u32) -> &'a [Value] {
    if n == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(vals, n as usize) }
    }
}

unsafe extern "C" fn stack_load(ctx: Ctx, depth: u32) -> Value {
    let vm = unsafe { vm(ctx) };
    vm.stack[vm.stack.len() - 1 - depth as usize]
}

unsafe extern "C" fn stack_restore(
    ctx: Ctx,
    frame_from_top: u32,
    consumed: u32,
    n: u32,
    vals: *const Value,
) {
    let vm = unsafe { vm(ctx) };
    let vals = unsafe { values(vals, n) };
    let fi = vm.frames.len() - 1 - frame_from_top as usize;
    let end = match vm.frames.get(fi + 1) {
        Some(f) => f.base,
        None => vm.stack.len(),
    };
    vm.stack
        .splice(end - consumed as usize..end, vals.iter().copied());
    for f in &mut vm.frames[fi + 1..] {
        f.base = f.base + vals.len() - consumed as usize;
    }
}

unsafe extern "C" fn env_load(ctx: Ctx, level: u32, idx: u32) -> Value {
    let vm = unsafe { vm(ctx) };
    let fi = vm.frames.len() - 1 - level as usize;
    vm.frames[fi].locals[idx as usize]
}

unsafe extern "C" fn env_store(ctx: Ctx, level: u32, idx: u32, val: Value) {
    let vm = unsafe { vm(ctx) };
    let fi = vm.frames.len() - 1 - level as usize;
    vm.frames[fi].locals[idx as usize] = val;
}

unsafe extern "C" fn load_self(ctx: Ctx) -> Value {
    unsafe { vm(ctx) }.frame().self_val
}

unsafe extern "C" fn guard_type(ctx: Ctx, val: Value, ty: u32) -> u8 {
    let vm = unsafe { vm(ctx) };
    u8::from(ValueType::from_repr(ty) == Some(vm.value_type_of(val)))
}

unsafe extern "C" fn is_truthy(_: Ctx, val: Value) -> u8 {
    u8::from(truthy(val))
}

unsafe extern "C" fn method_cache_valid(ctx: Ctx, site: u32, recv: Value) -> u8 {
    u8::from(unsafe { vm(ctx) }.cache_valid(CallSite(site), recv))
}

/// Builtin methods can't be redefined.
unsafe extern "C" fn method_unredefined(_: Ctx, _ty: u32, _op: u32) -> u8 {
    1
}

unsafe extern "C" fn property_valid(ctx: Ctx, recv: Value, name: u32, index: u32) -> u8 {
    let vm = unsafe { vm(ctx) };
    let valid = match vm.obj(recv) {
        Some(Obj::Object { class, .. }) => vm.ivar_slot(*class, Symbol(name)) == Some(index),
        _ => false,
    };
    u8::from(valid)
}

unsafe extern "C" fn fixnum_op(_: Ctx, op: u32, lhs: Value, rhs: Value, out: *mut Value) -> u8 {
    let (Some(op), Some(a), Some(b)) = (FixnumOp::from_repr(op), as_fixnum(lhs), as_fixnum(rhs))
    else {
        return 1;
    };
    match fixnum_arith(op, a, b) {
        Ok(x) => {
            unsafe { *out = x };
            0
        }
        Err(_) => 1,
    }
}

unsafe extern "C" fn float_op(ctx: Ctx, op: u32, lhs: Value, rhs: Value) -> Value {
    let vm = unsafe { vm(ctx) };
    match (FloatOp::from_repr(op), vm.float(lhs), vm.float(rhs)) {
        (Some(op), Some(a), Some(b)) => vm.float_arith(op, a, b),
        _ => QNIL,
    }
}

unsafe extern "C" fn convert(ctx: Ctx, op: u32, val: Value) -> Value {
    let vm = unsafe { vm(ctx) };
    match ConvOp::from_repr(op) {
        Some(ConvOp::FixnumToFloat) => match as_fixnum(val) {
            Some(x) => vm.alloc_float(x as f64),
            None => QNIL,
        },
        Some(ConvOp::FixnumToString | ConvOp::FloatToString | ConvOp::ObjectToString) => {
            vm.object_to_string(val)
        }
        None => QNIL,
    }
}

unsafe extern "C" fn object_not(_: Ctx, val: Value) -> Value {
    bool_val(!truthy(val))
}

unsafe extern "C" fn string_add(ctx: Ctx, lhs: Value, rhs: Value) -> Value {
    unsafe { vm(ctx) }.string_add(lhs, rhs)
}

unsafe extern "C" fn alloc_string(ctx: Ctx, val: Value) -> Value {
    let vm = unsafe { vm(ctx) };
    let s = vm.to_s(val);
    vm.alloc_str(s)
}

unsafe extern "C" fn alloc_array(ctx: Ctx, n: u32, vals: *const Value) -> Value {
    let vm = unsafe { vm(ctx) };
    let xs = unsafe { values(vals, n) }.to_vec();
    vm.alloc(Obj::Array(xs))
}

unsafe extern "C" fn alloc_hash(ctx: Ctx, n: u32, vals: *const Value) -> Value {
    let vm = unsafe { vm(ctx) };
    vm.alloc_hash(unsafe { values(vals, n) })
}

unsafe extern "C" fn alloc_range(ctx: Ctx, low: Value, high: Value, exclusive: u8) -> Value {
    unsafe { vm(ctx) }.alloc(Obj::Range {
        low,
        high,
        exclusive: exclusive != 0,
    })
}

unsafe extern "C" fn get_property(ctx: Ctx, recv: Value, index: u32) -> Value {
    unsafe { vm(ctx) }.get_property(recv, index)
}

unsafe extern "C" fn set_property(ctx: Ctx, recv: Value, index: u32, val: Value) {
    unsafe { vm(ctx) }.set_property(recv, index, val)
}

unsafe extern "C" fn get_global(ctx: Ctx, name: u32) -> Value {
    let vm = unsafe { vm(ctx) };
    vm.globals.get(&Symbol(name)).copied().unwrap_or(QNIL)
}

unsafe extern "C" fn set_global(ctx: Ctx, name: u32, val: Value) {
    unsafe { vm(ctx) }.globals.insert(Symbol(name), val);
}

unsafe extern "C" fn invoke_method(
    ctx: Ctx,
    site: u32,
    argc: u32,
    argv: *const Value,
    out: *mut Value,
) -> u8 {
    let vm = unsafe { vm(ctx) };
    let argv = unsafe { values(argv, argc) };
    match vm.call_native(CallSite(site), argv) {
        Ok(x) => {
            unsafe { *out = x };
            0
        }
        // The interpreter raises this again when it re-executes the call.
        Err(_) => 1,
    }
}

unsafe extern "C" fn frame_push(
    ctx: Ctx,
    method: u32,
    return_pc: usize,
    argc: u32,
    argv: *const Value,
) {
    let vm = unsafe { vm(ctx) };
    let argv = unsafe { values(argv, argc) };
    vm.push_frame(MethodId(method), return_pc, argv);
}

unsafe extern "C" fn frame_pop(ctx: Ctx) {
    unsafe { vm(ctx) }.pop_frame();
}

/// The functions compiled traces use to manipulate a [Vm].
pub fn runtime_table() -> RuntimeTable {
    RuntimeTable {
        stack_load,
        stack_restore,
        env_load,
        env_store,
        load_self,
        guard_type,
        truthy: is_truthy,
        method_cache_valid,
        method_unredefined,
        property_valid,
        fixnum_op,
        float_op,
        convert,
        object_not,
        string_add,
        alloc_string,
        alloc_array,
        alloc_hash,
        alloc_range,
        get_property,
        set_property,
        get_global,
        set_global,
        invoke_method,
        frame_push,
        frame_pop,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tjvm::load;
    use tjit::host::Frame;

    fn vm() -> Vm {
        let mut vm = load(
            "
            def main 0 1
                putnil
                leave
            end
            ",
        )
        .unwrap();
        vm.run(None).unwrap();
        vm.push_frame(MethodId(0), 0, &[QNIL]);
        vm
    }

    #[test]
    fn restore_shifts_inner_frames() {
        let mut vm = vm();
        let rt = runtime_table();
        let (one, two, three) = (
            fixnum(1).unwrap(),
            fixnum(2).unwrap(),
            fixnum(3).unwrap(),
        );
        vm.stack.extend([one, two]);
        let ctx = vm.native_ctx();
        unsafe {
            (rt.frame_push)(ctx, 0, 99, 1, [QNIL].as_ptr());
            // Outer frame: replace its top value with two others.
            (rt.stack_restore)(ctx, 1, 1, 2, [three, three].as_ptr());
            (rt.stack_restore)(ctx, 0, 0, 1, [one].as_ptr());
        }
        assert_eq!(vm.stack, vec![one, three, three, one]);
        assert_eq!(vm.frames.last().unwrap().base, 3);
        assert_eq!(vm.frames.last().unwrap().ret_pc, 99);
        unsafe { (rt.frame_pop)(vm.native_ctx()) };
        assert_eq!(vm.stack, vec![one, three, three]);
    }

    #[test]
    fn fixnum_op_reports_overflow() {
        let rt = runtime_table();
        let mut out = QNIL;
        let max = fixnum(i64::MAX >> 1).unwrap();
        let one = fixnum(1).unwrap();
        unsafe {
            let ctx = std::ptr::null_mut();
            assert_eq!((rt.fixnum_op)(ctx, FixnumOp::Add as u32, max, one, &mut out), 1);
            assert_eq!((rt.fixnum_op)(ctx, FixnumOp::Lt as u32, one, max, &mut out), 0);
        }
        assert_eq!(out, QTRUE);
    }

    #[test]
    fn property_validity() {
        let mut vm = vm();
        let rt = runtime_table();
        let x = vm.intern("x");
        let obj = vm.alloc(Obj::Object {
            class: OBJECT,
            ivars: Vec::new(),
        });
        vm.set_ivar(obj, x, QTRUE).unwrap();
        let ctx = vm.native_ctx();
        unsafe {
            assert_eq!((rt.property_valid)(ctx, obj, x.0, 0), 1);
            assert_eq!((rt.property_valid)(ctx, obj, x.0, 1), 0);
            assert_eq!((rt.get_property)(ctx, obj, 0), QTRUE);
            assert_eq!((rt.get_property)(ctx, obj, 5), QNIL);
            assert_eq!((rt.property_valid)(ctx, QNIL, x.0, 0), 0);
        }
    }
}
