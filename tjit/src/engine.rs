//! The trace selector: the part of tjit an interpreter consults before executing each bytecode
//! instruction.

use crate::{
    compile::{
        default_backend,
        ir::{Module, SnapshotIdx, TraceId},
        opt::optimise,
        recorder::{Recorded, Recorder, TraceEnd},
        CodegenBackend, CompilationError, CompiledTrace,
    },
    config::JitConfig,
    host::{Frame, Insn, Pc, RuntimeTable, Value},
    log::{
        log_ir, should_log_ir,
        stats::{Stats, TimingState},
        IRPhase, Log, Verbosity,
    },
    trace::{Trace, TraceState},
};
use std::{collections::HashMap, error::Error, mem};
use typed_index_collections::TiVec;

enum Selector {
    /// Nothing of interest has happened since the last trace finished or ran.
    Idle,
    /// At least one backward branch has been counted.
    Counting,
    /// `recorder` is `None` until the interpreter reaches the start pc of `trace`.
    Recording {
        trace: TraceId,
        recorder: Option<Recorder>,
    },
}

/// A trace-based JIT attached to one interpreter thread.
///
/// The interpreter must call [JitEngine::step] before executing each bytecode instruction, and
/// then continue at the pc it returns.
pub struct JitEngine {
    config: JitConfig,
    runtime: RuntimeTable,
    backend: Box<dyn CodegenBackend>,
    log: Log,
    stats: Stats,
    traces: TiVec<TraceId, Trace>,
    /// Root traces, keyed by the loop header they start at.
    roots: HashMap<Pc, TraceId>,
    selector: Selector,
    /// The IR of the last trace recorded, kept so that its allocations can be reused.
    spare: Option<Module>,
    /// The last trace run left through an exit at its own start: don't enter it again until the
    /// interpreter has executed the instruction at this pc.
    skip: Option<Pc>,
}

impl JitEngine {
    /// Create an engine that compiles traces calling back into the host through `runtime`.
    pub fn new(config: JitConfig, runtime: RuntimeTable) -> Result<Self, Box<dyn Error>> {
        let backend = default_backend(&config);
        Ok(Self {
            config,
            runtime,
            backend,
            log: Log::new()?,
            stats: Stats::new(),
            traces: TiVec::new(),
            roots: HashMap::new(),
            selector: Selector::Idle,
            spare: None,
            skip: None,
        })
    }

    /// The interpreter is about to execute `insn` at `pc` in `frame`. Returns the pc the
    /// interpreter must execute next: `pc` itself, unless a compiled trace ran, in which case the
    /// pc of the side exit it left through. In the latter case `frame` has already been updated
    /// through the [RuntimeTable].
    pub fn step(&mut self, frame: &mut dyn Frame, pc: Pc, insn: &Insn) -> Pc {
        if !self.config.enabled {
            return pc;
        }
        if let Selector::Recording { .. } = self.selector {
            self.record(frame, pc, insn);
            return pc;
        }
        if self.skip.take() != Some(pc) {
            if let Some(tid) = self.compiled_root(pc) {
                return self.execute(frame, tid);
            }
        }
        if let Some(target) = insn.branch_target(|| frame.is_truthy(frame.topn(0))) {
            if target < pc {
                self.backward_branch(pc, target);
            }
        }
        pc
    }

    /// Is a trace currently being recorded (or waiting to be)?
    pub fn is_recording(&self) -> bool {
        matches!(self.selector, Selector::Recording { .. })
    }

    /// How many traces (root and side) have been compiled?
    pub fn compiled_traces(&self) -> usize {
        self.traces.iter().filter(|t| t.compiled().is_some()).count()
    }

    fn compiled_root(&self, pc: Pc) -> Option<TraceId> {
        self.roots
            .get(&pc)
            .copied()
            .filter(|tid| self.traces[*tid].compiled().is_some())
    }

    /// Count a backward branch at `pc` to `target`.
    fn backward_branch(&mut self, pc: Pc, target: Pc) {
        let tid = match self.roots.get(&target) {
            Some(x) => *x,
            None => {
                let tid = TraceId::unchecked_from(self.traces.len());
                self.traces.push(Trace::new_root(target));
                self.roots.insert(target, tid);
                tid
            }
        };
        self.selector = Selector::Counting;
        if self.traces[tid].inc_count(pc, self.config.hot_threshold) {
            self.log.log(
                Verbosity::TraceTransition,
                &format!("trace {tid} at {target} is hot (branch from {pc})"),
            );
            self.selector = Selector::Recording {
                trace: tid,
                recorder: None,
            };
        }
    }

    /// Run the compiled trace `tid` and then, for as long as the exits taken lead to further
    /// compiled traces, those traces. Returns the pc the interpreter resumes at.
    fn execute(&mut self, frame: &mut dyn Frame, mut tid: TraceId) -> Pc {
        self.selector = Selector::Idle;
        self.stats.timing_state(TimingState::JitExecuting);
        let pc = loop {
            self.stats.trace_executed();
            let ctx = frame.native_ctx();
            let trace = &self.traces[tid];
            let compiled = trace
                .compiled()
                .expect("trace executed before it was compiled");
            let sidx = unsafe { compiled.invoke(ctx) };
            self.stats.side_exit();
            let pc = trace.exit(sidx).pc();
            if let Some(child) = trace.exit(sidx).child().or_else(|| trace.child_at(pc)) {
                self.log.log(Verbosity::JITEvent, "execute-side-trace");
                tid = child;
                continue;
            }
            if pc == trace.start_pc() {
                self.skip = Some(pc);
                break pc;
            }
            // Exits landing at the head of another compiled loop go straight into it.
            if let Some(x) = self.compiled_root(pc) {
                tid = x;
                continue;
            }
            if self.traces[tid]
                .exit_mut(sidx)
                .inc_taken(self.config.sidetrace_threshold)
            {
                self.start_side_trace(tid, sidx, pc);
            }
            break pc;
        };
        self.stats.timing_state(TimingState::OutsideJit);
        pc
    }

    /// The exit `sidx` of `parent`, which resumes at `pc`, has become hot.
    fn start_side_trace(&mut self, parent: TraceId, sidx: SnapshotIdx, pc: Pc) {
        let tid = match self.traces[parent].exit(sidx).side_trace() {
            Some(x) => x,
            None => {
                let tid = TraceId::unchecked_from(self.traces.len());
                self.traces.push(Trace::new_side(pc, parent, sidx));
                self.traces[parent].exit_mut(sidx).set_side_trace(tid);
                tid
            }
        };
        self.log.log(
            Verbosity::TraceTransition,
            &format!("exit {sidx} of trace {parent} is hot: side trace {tid} at {pc}"),
        );
        self.selector = Selector::Recording {
            trace: tid,
            recorder: None,
        };
    }

    /// The trace at the root of the tree `tid` belongs to.
    fn root_of(&self, mut tid: TraceId) -> TraceId {
        while let Some((parent, _)) = self.traces[tid].parent() {
            tid = parent;
        }
        tid
    }

    fn record(&mut self, frame: &mut dyn Frame, pc: Pc, insn: &Insn) {
        let (tid, recorder) = match mem::replace(&mut self.selector, Selector::Idle) {
            Selector::Recording { trace, recorder } => (trace, recorder),
            Selector::Idle | Selector::Counting => unreachable!(),
        };
        let mut recorder = match recorder {
            Some(x) => x,
            None if pc != self.traces[tid].start_pc() => {
                self.selector = Selector::Recording {
                    trace: tid,
                    recorder: None,
                };
                return;
            }
            None => match self.start_recording(frame, tid) {
                Ok(x) => x,
                Err(e) => {
                    self.stats.trace_recorded_err();
                    self.trace_failed(tid, &e.to_string());
                    return;
                }
            },
        };
        let compiled_start = self.compiled_root(pc).is_some_and(|x| x != tid);
        match recorder.record(frame, pc, insn, compiled_start) {
            Ok(Recorded::Continue) => {
                self.selector = Selector::Recording {
                    trace: tid,
                    recorder: Some(recorder),
                };
            }
            Ok(Recorded::End(end)) => self.finish(frame, tid, recorder.into_module(), end),
            Err(e) => {
                self.spare = Some(recorder.into_module());
                self.stats.trace_recorded_err();
                self.stats.timing_state(TimingState::OutsideJit);
                self.trace_failed(tid, &e.to_string());
            }
        }
    }

    fn start_recording(
        &mut self,
        frame: &dyn Frame,
        tid: TraceId,
    ) -> Result<Recorder, CompilationError> {
        self.traces[tid].reset();
        let start_pc = self.traces[tid].start_pc();
        let m = match self.spare.take() {
            Some(mut m) => {
                m.reset(tid, start_pc)?;
                m
            }
            None => Module::new(tid, start_pc)?,
        };
        let mut stop_pcs = vec![self.traces[self.root_of(tid)].start_pc()];
        if let Some((parent, _)) = self.traces[tid].parent() {
            stop_pcs.push(self.traces[parent].start_pc());
        }
        self.stats.timing_state(TimingState::Recording);
        let msg = match self.traces[tid].last_pc() {
            Some(x) => format!("start-tracing: trace {tid} at {start_pc} (loop end {x})"),
            None => format!("start-tracing: trace {tid} at {start_pc}"),
        };
        self.log.log(Verbosity::JITEvent, &msg);
        Ok(Recorder::new(m, &self.config, frame.stack_len(), stop_pcs))
    }

    /// Recording of `tid` into `m` stopped because of `end`: compile it if it's worth it.
    fn finish(&mut self, frame: &mut dyn Frame, tid: TraceId, mut m: Module, end: TraceEnd) {
        self.log.log(Verbosity::JITEvent, &format!("stop-tracing: {end}"));
        if !end.compilable() {
            self.stats.trace_recorded_err();
            self.trace_failed(tid, &end.to_string());
        } else if m.insts_len() < self.config.min_trace_length {
            self.stats.trace_recorded_err();
            self.trace_failed(tid, "trace too short");
        } else {
            self.stats.trace_recorded_ok();
            self.stats.timing_state(TimingState::Compiling);
            match self.compile(frame, &mut m) {
                Ok(ct) => {
                    self.stats.trace_compiled_ok();
                    self.link(tid, ct, &m);
                }
                Err(e) => {
                    self.stats.trace_compiled_err();
                    let level = match e {
                        CompilationError::InternalError(_)
                        | CompilationError::ResourceExhausted(_) => Verbosity::Error,
                        CompilationError::General(_) | CompilationError::LimitExceeded(_) => {
                            Verbosity::Warning
                        }
                    };
                    self.log
                        .log(level, &format!("trace-compilation-aborted: {e}"));
                    self.trace_failed(tid, "compilation failed");
                }
            }
        }
        self.stats.timing_state(TimingState::OutsideJit);
        self.spare = Some(m);
    }

    fn compile(
        &mut self,
        frame: &mut dyn Frame,
        m: &mut Module,
    ) -> Result<Box<dyn CompiledTrace>, CompilationError> {
        if should_log_ir(IRPhase::PreOpt) {
            log_ir(&format!(
                "--- Begin jit-pre-opt ---\n{m}\n--- End jit-pre-opt ---\n"
            ));
        }
        optimise(m, &self.config)?;
        if should_log_ir(IRPhase::PostOpt) {
            log_ir(&format!(
                "--- Begin jit-post-opt ---\n{m}\n--- End jit-post-opt ---\n"
            ));
        }
        #[cfg(debug_assertions)]
        m.assert_well_formed();
        // Literals no longer used by the trace are never read by it.
        let consts = m
            .consts()
            .map(|(lit, live)| if live { frame.materialize(lit) } else { Value(0) })
            .collect::<Box<[_]>>();
        self.backend
            .compile(m, consts, &self.runtime, &self.config)
    }

    /// Store the compiled trace `ct` recorded from `m` in `tid` and, if it is a side trace, make
    /// the exit it was recorded from run it.
    fn link(&mut self, tid: TraceId, ct: Box<dyn CompiledTrace>, m: &Module) {
        let start_pc = self.traces[tid].start_pc();
        self.traces[tid].set_compiled(ct, m.snapshots.iter().map(|s| s.pc));
        if let Some((parent, sidx)) = self.traces[tid].parent() {
            self.traces[parent].exit_mut(sidx).set_compiled();
            self.traces[parent].add_child(start_pc, tid);
        }
        self.log.log(
            Verbosity::TraceTransition,
            &format!("trace {tid} at {start_pc} compiled"),
        );
    }

    /// Recording or compiling `tid` failed because of `why`.
    fn trace_failed(&mut self, tid: TraceId, why: &str) {
        let threshold = self.config.trace_failure_threshold;
        match self.traces[tid].parent() {
            Some((parent, sidx)) => self.traces[parent]
                .exit_mut(sidx)
                .trace_or_compile_failed(threshold),
            None => self.traces[tid].trace_or_compile_failed(threshold),
        }
        let gave_up = match self.traces[tid].parent() {
            Some((parent, sidx)) => self.traces[parent].exit(sidx).is_abandoned(),
            None => *self.traces[tid].state() == TraceState::DontTrace,
        };
        let msg = if gave_up {
            format!("trace {tid} abandoned: {why}")
        } else {
            format!("trace {tid} aborted: {why}")
        };
        self.log.log(Verbosity::TraceTransition, &msg);
    }
}

impl Drop for JitEngine {
    fn drop(&mut self) {
        self.stats.output();
    }
}
