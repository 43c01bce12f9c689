//! Traces and their side exits: track the state of a loop header or side exit (counting,
//! recording, compiled, etc).

use crate::{
    compile::{
        ir::{SnapshotIdx, TraceId},
        CompiledTrace,
    },
    host::Pc,
};
use std::collections::HashMap;
use typed_index_collections::TiVec;

/// The states a [Trace] moves through. Root traces start in `Counting`, side traces in
/// `Recording`:
///
/// ```text
///               ┌──────────────────────────┐  increment count
///               │         Counting         │ ◀──────────────┐
///               └──────────────────────────┘ ───────────────┘
///                 │                ▲
///                 │ hot            │ failed below threshold
///                 ▼                │
/// ┌───────────┐ failed above    ┌──────────────────────────┐
/// │ DontTrace │ ◀────────────── │        Recording         │
/// └───────────┘ threshold       └──────────────────────────┘
///                                 │
///                                 │ compiled
///                                 ▼
///                               ┌──────────────────────────┐
///                               │         Compiled         │
///                               └──────────────────────────┘
/// ```
#[derive(Debug, PartialEq)]
pub(crate) enum TraceState {
    Counting(u32),
    /// Recording has been requested, is underway, or the recorded trace is being compiled.
    Recording,
    Compiled,
    /// Recording or compiling this trace failed sufficiently often that we don't want to try
    /// again.
    DontTrace,
}

pub(crate) struct Trace {
    start_pc: Pc,
    /// The pc of the most recent backward branch to `start_pc`.
    last_pc: Option<Pc>,
    /// For side traces, the trace and exit this trace was recorded from.
    parent: Option<(TraceId, SnapshotIdx)>,
    state: TraceState,
    /// How many times has recording or compiling this trace failed?
    errors: u32,
    compiled: Option<Box<dyn CompiledTrace>>,
    /// Compiled side traces, keyed by the pc of the exit they start at.
    children: HashMap<Pc, TraceId>,
    /// One handler per side exit of the compiled trace.
    exits: TiVec<SnapshotIdx, SideExitHandler>,
}

impl Trace {
    /// Create a root trace for the loop header at `start_pc`.
    pub(crate) fn new_root(start_pc: Pc) -> Self {
        Self::new(start_pc, None, TraceState::Counting(0))
    }

    /// Create a side trace starting at the exit `sidx` of `parent`.
    pub(crate) fn new_side(start_pc: Pc, parent: TraceId, sidx: SnapshotIdx) -> Self {
        Self::new(start_pc, Some((parent, sidx)), TraceState::Recording)
    }

    fn new(start_pc: Pc, parent: Option<(TraceId, SnapshotIdx)>, state: TraceState) -> Self {
        Self {
            start_pc,
            last_pc: None,
            parent,
            state,
            errors: 0,
            compiled: None,
            children: HashMap::new(),
            exits: TiVec::new(),
        }
    }

    pub(crate) fn start_pc(&self) -> Pc {
        self.start_pc
    }

    pub(crate) fn last_pc(&self) -> Option<Pc> {
        self.last_pc
    }

    pub(crate) fn parent(&self) -> Option<(TraceId, SnapshotIdx)> {
        self.parent
    }

    pub(crate) fn state(&self) -> &TraceState {
        &self.state
    }

    /// A backward branch at `pc` targeted this trace's start. Returns `true` if this trace has
    /// become hot enough to be recorded.
    pub(crate) fn inc_count(&mut self, pc: Pc, hot_threshold: u32) -> bool {
        self.last_pc = Some(pc);
        match self.state {
            TraceState::Counting(x) => {
                if x + 1 > hot_threshold {
                    self.state = TraceState::Recording;
                    true
                } else {
                    self.state = TraceState::Counting(x + 1);
                    false
                }
            }
            TraceState::Recording | TraceState::Compiled | TraceState::DontTrace => false,
        }
    }

    /// Inform this trace that recording or compiling it failed.
    pub(crate) fn trace_or_compile_failed(&mut self, failure_threshold: u32) {
        assert_eq!(self.state, TraceState::Recording);
        self.errors += 1;
        if self.errors >= failure_threshold {
            self.state = TraceState::DontTrace;
        } else {
            self.state = TraceState::Counting(0);
        }
    }

    /// Store the compiled form of this trace, which has a side exit at each pc in `exit_pcs`.
    pub(crate) fn set_compiled(
        &mut self,
        ct: Box<dyn CompiledTrace>,
        exit_pcs: impl Iterator<Item = Pc>,
    ) {
        assert_eq!(self.state, TraceState::Recording);
        self.exits = exit_pcs.map(SideExitHandler::new).collect();
        self.compiled = Some(ct);
        self.state = TraceState::Compiled;
    }

    pub(crate) fn compiled(&self) -> Option<&dyn CompiledTrace> {
        self.compiled.as_deref()
    }

    pub(crate) fn exit(&self, sidx: SnapshotIdx) -> &SideExitHandler {
        &self.exits[sidx]
    }

    pub(crate) fn exit_mut(&mut self, sidx: SnapshotIdx) -> &mut SideExitHandler {
        &mut self.exits[sidx]
    }

    pub(crate) fn add_child(&mut self, pc: Pc, child: TraceId) {
        self.children.insert(pc, child);
    }

    pub(crate) fn child_at(&self, pc: Pc) -> Option<TraceId> {
        self.children.get(&pc).copied()
    }

    /// Discard everything learnt from previous recordings of this trace before it is recorded
    /// again. The state and failure count are kept.
    pub(crate) fn reset(&mut self) {
        self.compiled = None;
        self.children.clear();
        self.exits.clear();
    }
}

#[derive(Debug, PartialEq)]
enum ExitState {
    Counting(u32),
    /// A side trace is being recorded or compiled from this exit.
    SideTracing,
    Compiled,
    DontTrace,
}

/// Responsible for tracking how often a side exit of a compiled trace is taken. Also records the
/// side trace once it is compiled.
#[derive(Debug)]
pub(crate) struct SideExitHandler {
    pc: Pc,
    state: ExitState,
    /// How many errors have been encountered when recording or compiling traces from this exit?
    errors: u32,
    /// The side trace recorded from this exit, if one has ever been started.
    trace: Option<TraceId>,
}

impl SideExitHandler {
    pub(crate) fn new(pc: Pc) -> Self {
        Self {
            pc,
            state: ExitState::Counting(0),
            errors: 0,
            trace: None,
        }
    }

    /// The pc the interpreter resumes at when this exit is taken.
    pub(crate) fn pc(&self) -> Pc {
        self.pc
    }

    /// This exit has been taken. Returns `true` if it has been taken often enough to be worth
    /// side-tracing.
    pub(crate) fn inc_taken(&mut self, sidetrace_threshold: u32) -> bool {
        match self.state {
            ExitState::Counting(x) => {
                if x + 1 >= sidetrace_threshold {
                    self.state = ExitState::SideTracing;
                    true
                } else {
                    self.state = ExitState::Counting(x + 1);
                    false
                }
            }
            ExitState::SideTracing | ExitState::Compiled | ExitState::DontTrace => false,
        }
    }

    /// The trace previously started from this exit, if any. A failed side trace is re-recorded
    /// into the same trace.
    pub(crate) fn side_trace(&self) -> Option<TraceId> {
        self.trace
    }

    pub(crate) fn set_side_trace(&mut self, tid: TraceId) {
        assert_eq!(self.state, ExitState::SideTracing);
        self.trace = Some(tid);
    }

    /// Inform this exit that a trace started from it failed (either in recording or compiling).
    pub(crate) fn trace_or_compile_failed(&mut self, failure_threshold: u32) {
        assert_eq!(self.state, ExitState::SideTracing);
        self.errors += 1;
        if self.errors >= failure_threshold {
            self.state = ExitState::DontTrace;
        } else {
            self.state = ExitState::Counting(0);
        }
    }

    /// The side trace from this exit has been compiled.
    pub(crate) fn set_compiled(&mut self) {
        assert_eq!(self.state, ExitState::SideTracing);
        assert!(self.trace.is_some());
        self.state = ExitState::Compiled;
    }

    /// Have we given up side-tracing from this exit?
    pub(crate) fn is_abandoned(&self) -> bool {
        self.state == ExitState::DontTrace
    }

    /// The compiled side trace to run when this exit is taken.
    pub(crate) fn child(&self) -> Option<TraceId> {
        match self.state {
            ExitState::Compiled => self.trace,
            _ => None,
        }
    }
}
