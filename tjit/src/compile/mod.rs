use crate::{
    config::{Backend, JitConfig},
    host::{Ctx, Pc, RuntimeTable, Value},
};
use std::{
    error::Error,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;

pub(crate) mod callstack;
pub(crate) mod cgen;
pub(crate) mod eval;
pub(crate) mod ir;
pub(crate) mod opt;
pub(crate) mod recorder;
pub(crate) mod regstack;

use ir::{InstIdx, Module, SnapshotIdx};

/// A failure to compile a trace.
#[derive(Error, Debug)]
pub(crate) enum CompilationError {
    #[error("General error: {0}")]
    /// Compilation failed for reasons that might be of interest to a programmer attaching tjit to
    /// an interpreter but not to the end user running a program on the interpreter.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in tjit.
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A limit was exceeded (e.g. an index type overflowed or the optimiser failed to reach a
    /// fixed point quickly enough).
    LimitExceeded(String),
    #[error("Resource exhausted: {0}")]
    /// Compilation failed because an external resource was exhausted: the end user running the
    /// interpreter probably wants to be informed of this.
    ResourceExhausted(Box<dyn Error>),
}

/// The trait that every code generator must implement.
pub(crate) trait CodegenBackend {
    /// Compile the optimised trace `m` into something executable. `consts[i]` is the
    /// materialised value of the literal `ConstIdx(i)`.
    fn compile(
        &self,
        m: &Module,
        consts: Box<[Value]>,
        runtime: &RuntimeTable,
        config: &JitConfig,
    ) -> Result<Box<dyn CompiledTrace>, CompilationError>;
}

pub(crate) fn default_backend(config: &JitConfig) -> Box<dyn CodegenBackend> {
    match config.backend {
        Backend::CGen => Box::new(cgen::CGen::new()),
        Backend::Eval => Box::new(eval::Eval),
    }
}

pub(crate) trait CompiledTrace: fmt::Debug {
    /// Execute this trace until it leaves through a side exit, returning the index of that exit.
    /// By the time this returns, the interpreter state has been restored to that of the exit.
    ///
    /// # Safety
    ///
    /// `ctx` must be the pointer the host expects its [RuntimeTable] functions to be called with,
    /// and the interpreter must be at the start pc of this trace with at least as many values on
    /// its operand stack as the trace reserved.
    unsafe fn invoke(&self, ctx: Ctx) -> SnapshotIdx;
}

/// One interpreter frame's worth of operand stack to restore at a side exit.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ExitFrame {
    /// How many values to pop from the frame's operand stack before pushing `vals`.
    pub(crate) consumed: u32,
    pub(crate) vals: Vec<InstIdx>,
}

/// Everything needed to return to the interpreter at a side exit. `frames[0]` is the frame the
/// trace was entered in; later elements are frames pushed by inlined calls.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ExitPlan {
    pub(crate) pc: Pc,
    pub(crate) frames: Vec<ExitFrame>,
}

impl ExitPlan {
    /// Iterate over `(frame_from_top, frame)` pairs, outermost frame first.
    pub(crate) fn frames_from_top(&self) -> impl Iterator<Item = (u32, &ExitFrame)> {
        let n = self.frames.len();
        self.frames
            .iter()
            .enumerate()
            .map(move |(i, f)| (u32::try_from(n - 1 - i).unwrap_or(u32::MAX), f))
    }
}

/// The number of compilations currently underway in this process.
static INFLIGHT_COMPILES: AtomicUsize = AtomicUsize::new(0);

/// Counts as one in-flight compilation until dropped.
pub(crate) struct InflightCompile(());

impl InflightCompile {
    pub(crate) fn new(max: usize) -> Result<Self, CompilationError> {
        let prev = INFLIGHT_COMPILES.fetch_add(1, Ordering::Relaxed);
        if prev >= max {
            INFLIGHT_COMPILES.fetch_sub(1, Ordering::Relaxed);
            return Err(CompilationError::ResourceExhausted(
                format!("{max} compilations already in flight").into(),
            ));
        }
        Ok(Self(()))
    }
}

impl Drop for InflightCompile {
    fn drop(&mut self) {
        INFLIGHT_COMPILES.fetch_sub(1, Ordering::Relaxed);
    }
}
