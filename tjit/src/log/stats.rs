//! This module records statistics about tjit and the interpreter it is attached to. Durations are
//! wall-clock time, so they are only ever a rough guide.

use std::{
    cell::RefCell,
    env, fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record tjit statistics if the end user defines the environment variable `TJD_LOG_STATS`.
pub(crate) struct Stats {
    // Most runs won't record statistics, so the common case is a single `None` check.
    inner: Option<RefCell<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many traces were recorded successfully?
    traces_recorded_ok: u64,
    /// How many traces were recorded unsuccessfully?
    traces_recorded_err: u64,
    /// How many traces were compiled successfully?
    traces_compiled_ok: u64,
    /// How many traces were compiled unsuccessfully?
    traces_compiled_err: u64,
    /// How many times have traces been entered from the interpreter or from a side exit?
    trace_executions: u64,
    /// How many times have compiled traces returned to the interpreter through a side exit?
    side_exits: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
    /// The state we're currently in and when we entered it.
    state: (TimingState, Instant),
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self::with_output(env::var("TJD_LOG_STATS").ok())
    }

    fn with_output(output_path: Option<String>) -> Self {
        Self {
            inner: output_path.map(|p| RefCell::new(StatsInner::new(p))),
        }
    }

    /// If `TJD_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(x) = &self.inner {
            f(&mut x.borrow_mut());
        }
    }

    /// Increment the "a trace has been recorded successfully" count.
    pub(crate) fn trace_recorded_ok(&self) {
        self.update_with(|inner| inner.traces_recorded_ok += 1);
    }

    /// Increment the "a trace has been recorded unsuccessfully" count.
    pub(crate) fn trace_recorded_err(&self) {
        self.update_with(|inner| inner.traces_recorded_err += 1);
    }

    /// Increment the "a trace has been compiled successfully" count.
    pub(crate) fn trace_compiled_ok(&self) {
        self.update_with(|inner| inner.traces_compiled_ok += 1);
    }

    /// Increment the "a trace has been compiled unsuccessfully" count.
    pub(crate) fn trace_compiled_err(&self) {
        self.update_with(|inner| inner.traces_compiled_err += 1);
    }

    /// Increment the "a compiled trace has started execution" count.
    pub(crate) fn trace_executed(&self) {
        self.update_with(|inner| inner.trace_executions += 1);
    }

    pub(crate) fn side_exit(&self) {
        self.update_with(|inner| inner.side_exits += 1);
    }

    /// Change the [TimingState] the engine is in.
    pub(crate) fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = std::mem::replace(&mut inner.state, (new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.timing_state(TimingState::None);
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            traces_recorded_ok: 0,
            traces_recorded_err: 0,
            traces_compiled_ok: 0,
            traces_compiled_err: 0,
            trace_executions: 0,
            side_exits: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
            state: (TimingState::OutsideJit, Instant::now()),
        }
    }

    /// Output these statistics to the appropriate output path.
    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string (e.g. in lang_tester) is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            ("side_exits".to_owned(), self.side_exits.to_string()),
            (
                "trace_executions".to_owned(),
                self.trace_executions.to_string(),
            ),
            (
                "traces_compiled_err".to_owned(),
                self.traces_compiled_err.to_string(),
            ),
            (
                "traces_compiled_ok".to_owned(),
                self.traces_compiled_ok.to_string(),
            ),
            (
                "traces_recorded_err".to_owned(),
                self.traces_recorded_err.to_string(),
            ),
            (
                "traces_recorded_ok".to_owned(),
                self.traces_recorded_ok.to_string(),
            ),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        // We sort the output fields so that tests can match the output with a simple text match.
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states the engine can go through.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// Every variant's `to_string` is the JSON key its duration is reported under; the empty string
// means "not reported". Variants must not be assigned explicit discriminants.
pub(crate) enum TimingState {
    /// Time spent in this state is not counted towards anything.
    #[strum(to_string = "")]
    None,
    /// Recording a trace into IR.
    #[strum(to_string = "duration_recording")]
    Recording,
    /// Optimising and generating code for a trace.
    #[strum(to_string = "duration_compiling")]
    Compiling,
    /// Executing compiled traces.
    #[strum(to_string = "duration_jit_executing")]
    JitExecuting,
    /// Roughly "in the interpreter".
    #[strum(to_string = "duration_outside_jit")]
    OutsideJit,
}
