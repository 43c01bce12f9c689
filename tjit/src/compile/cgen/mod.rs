//! A code generator which lowers traces to C, compiles them with an external toolchain, and
//! loads the resulting shared object.
//!
//! Each trace becomes its own translation unit (see [emit]) containing two functions:
//! `init_trace_<n>`, which is called once after loading to hand the trace its [RuntimeTable],
//! constants, and exit records, and `trace_<n>`, which runs the trace and returns a pointer to the
//! record of the exit it left through.

use super::{
    ir::{Module, SnapshotIdx},
    CodegenBackend, CompilationError, CompiledTrace, InflightCompile,
};
use crate::{
    config::JitConfig,
    host::{Ctx, RuntimeTable, Value},
    log::{log_ir, should_log_ir, IRPhase},
};
use libloading::Library;
use std::{
    env, fs,
    path::Path,
    process::{self, Command},
    sync::atomic::{AtomicUsize, Ordering},
};
use tempfile::NamedTempFile;

mod emit;

/// Distinguishes the source files of different compilations within this process.
static SERIAL: AtomicUsize = AtomicUsize::new(0);

/// Mirrors the C `ExitRecord` struct.
#[repr(C)]
#[derive(Debug)]
struct ExitRecord {
    idx: u32,
    pc: usize,
}

/// Mirrors the C `TraceInfo` struct.
#[repr(C)]
#[derive(Debug)]
struct TraceInfo {
    consts: *const Value,
    exits: *const ExitRecord,
}

type InitFn = unsafe extern "C" fn(*const RuntimeTable, *const TraceInfo);
type TraceFn = unsafe extern "C" fn(Ctx) -> *const ExitRecord;

pub(crate) struct CGen;

impl CGen {
    pub(crate) fn new() -> Self {
        CGen
    }
}

impl CodegenBackend for CGen {
    fn compile(
        &self,
        m: &Module,
        consts: Box<[Value]>,
        runtime: &RuntimeTable,
        config: &JitConfig,
    ) -> Result<Box<dyn CompiledTrace>, CompilationError> {
        let _inflight = InflightCompile::new(config.max_inflight_compiles)?;
        let src = emit::emit(m)?;
        if should_log_ir(IRPhase::CSource) {
            log_ir(&format!(
                "--- Begin c-source ---\n{src}\n--- End c-source ---\n"
            ));
        }

        let src_path = env::temp_dir().join(format!(
            "tjit.{}.{}.c",
            process::id(),
            SERIAL.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&src_path, &src).map_err(|e| CompilationError::ResourceExhausted(e.into()))?;
        let lib_file = tempfile::Builder::new()
            .prefix("tjit.")
            .suffix(".so")
            .tempfile()
            .map_err(|e| CompilationError::ResourceExhausted(e.into()))?;
        let r = run_toolchain(&config.cc_command, &src_path, lib_file.path());
        if !config.keep_sources {
            fs::remove_file(&src_path).ok();
        }
        r?;

        CTrace::load(m, lib_file, consts, *runtime)
            .map(|x| Box::new(x) as Box<dyn CompiledTrace>)
    }
}

/// Run the command template `cmd` (with `{lib}` and `{src}` substituted) through the shell.
fn run_toolchain(cmd: &str, src: &Path, lib: &Path) -> Result<(), CompilationError> {
    let cmd = cmd
        .replace("{lib}", &shell_quote(lib))
        .replace("{src}", &shell_quote(src));
    let out = Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .output()
        .map_err(|e| CompilationError::ResourceExhausted(e.into()))?;
    if !out.status.success() {
        return Err(CompilationError::General(format!(
            "`{cmd}` failed ({}):\n{}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(())
}

fn shell_quote(p: &Path) -> String {
    format!("'{}'", p.to_string_lossy().replace('\'', r"'\''"))
}

/// A trace compiled to, and loaded from, a shared object.
#[derive(Debug)]
struct CTrace {
    entry: TraceFn,
    /// One record per snapshot, in [SnapshotIdx] order. The C code returns pointers into this.
    exits: Box<[ExitRecord]>,
    // The following are only referenced by the loaded code.
    _consts: Box<[Value]>,
    _runtime: Box<RuntimeTable>,
    _lib: Library,
    _lib_file: NamedTempFile,
}

impl CTrace {
    fn load(
        m: &Module,
        lib_file: NamedTempFile,
        consts: Box<[Value]>,
        runtime: RuntimeTable,
    ) -> Result<Self, CompilationError> {
        let exits = m
            .snapshots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                Ok(ExitRecord {
                    idx: u32::try_from(i)
                        .map_err(|_| CompilationError::LimitExceeded("too many exits".into()))?,
                    pc: s.pc.0,
                })
            })
            .collect::<Result<Box<[_]>, CompilationError>>()?;
        let runtime = Box::new(runtime);
        let lib = unsafe { Library::new(lib_file.path()) }
            .map_err(|e| CompilationError::General(format!("loading trace: {e}")))?;
        let (init, entry) = unsafe {
            let init = *lib
                .get::<InitFn>(emit::init_sym(m).as_bytes())
                .map_err(|e| CompilationError::General(e.to_string()))?;
            let entry = *lib
                .get::<TraceFn>(emit::trace_sym(m).as_bytes())
                .map_err(|e| CompilationError::General(e.to_string()))?;
            (init, entry)
        };
        let info = TraceInfo {
            consts: consts.as_ptr(),
            exits: exits.as_ptr(),
        };
        unsafe { init(&*runtime, &info) };
        Ok(Self {
            entry,
            exits,
            _consts: consts,
            _runtime: runtime,
            _lib: lib,
            _lib_file: lib_file,
        })
    }
}

impl CompiledTrace for CTrace {
    unsafe fn invoke(&self, ctx: Ctx) -> SnapshotIdx {
        let rec = unsafe { (self.entry)(ctx) };
        let off = unsafe { rec.offset_from(self.exits.as_ptr()) };
        debug_assert_eq!(self.exits[off as usize].idx as isize, off);
        SnapshotIdx::unchecked_from(off as usize)
    }
}
