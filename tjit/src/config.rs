//! Tunables for a [crate::JitEngine].

use std::env;

/// The default hotness threshold: a loop header must be reached by a backward branch more often
/// than this before it is recorded.
pub const DEFAULT_HOT_THRESHOLD: u32 = 4;
/// The default number of times a side exit must fire before a child trace is recorded from it.
pub const DEFAULT_SIDETRACE_THRESHOLD: u32 = 4;
/// The default maximum number of IR instructions in a trace.
pub const DEFAULT_MAX_TRACE_LENGTH: usize = 1024;
/// Traces with fewer IR instructions than this are not worth compiling.
pub const DEFAULT_MIN_TRACE_LENGTH: usize = 8;
/// The default number of distinct pcs a recording reserves space for.
pub const DEFAULT_TRACE_INIT_SIZE: usize = 16;
/// How many operand stack slots live at trace entry may be read by a trace?
pub const DEFAULT_RESERVED_REGSTACK: usize = 8;
/// How many times can recording or compiling a trace fail at a given location before we give up?
pub const DEFAULT_TRACE_FAILURE_THRESHOLD: u32 = 5;
/// The optimiser gives up after this many worklist steps per IR instruction.
pub const DEFAULT_OPT_ITERATION_FACTOR: usize = 16;
/// The width, in bits, of the host's fixnums.
pub const DEFAULT_FIXNUM_BITS: u32 = 63;
/// The default toolchain command: `{lib}` and `{src}` are replaced by the output library and
/// input source paths respectively.
pub const DEFAULT_CC_COMMAND: &str = "cc -O2 -shared -fPIC -o {lib} {src}";

/// Which code generator compiles traces?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    /// Emit C, compile it with an external toolchain, and load the result.
    CGen,
    /// Interpret the optimised IR in-process.
    Eval,
}

/// Configure a [crate::JitEngine].
#[derive(Clone, Debug)]
pub struct JitConfig {
    pub(crate) enabled: bool,
    pub(crate) hot_threshold: u32,
    pub(crate) sidetrace_threshold: u32,
    pub(crate) max_trace_length: usize,
    pub(crate) min_trace_length: usize,
    pub(crate) trace_init_size: usize,
    pub(crate) reserved_regstack: usize,
    pub(crate) trace_failure_threshold: u32,
    pub(crate) max_inflight_compiles: usize,
    pub(crate) opt_iteration_factor: usize,
    pub(crate) fixnum_bits: u32,
    pub(crate) cc_command: String,
    pub(crate) keep_sources: bool,
    pub(crate) backend: Backend,
}

impl JitConfig {
    /// Create a configuration with default values. If the environment variable
    /// `TJIT_DISABLE_JIT` is set to a non-zero integer the JIT is disabled. `TJ_JITC=eval` selects
    /// the [Backend::Eval] backend; anything else the [Backend::CGen] backend.
    pub fn new() -> Self {
        let backend = match env::var("TJ_JITC").as_deref() {
            Ok("eval") => Backend::Eval,
            _ => Backend::CGen,
        };
        let enabled = match env::var("TJIT_DISABLE_JIT") {
            Ok(x) => x.trim().parse::<i64>().map(|x| x == 0).unwrap_or(true),
            Err(_) => true,
        };
        Self {
            enabled,
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            sidetrace_threshold: DEFAULT_SIDETRACE_THRESHOLD,
            max_trace_length: DEFAULT_MAX_TRACE_LENGTH,
            min_trace_length: DEFAULT_MIN_TRACE_LENGTH,
            trace_init_size: DEFAULT_TRACE_INIT_SIZE,
            reserved_regstack: DEFAULT_RESERVED_REGSTACK,
            trace_failure_threshold: DEFAULT_TRACE_FAILURE_THRESHOLD,
            max_inflight_compiles: num_cpus::get(),
            opt_iteration_factor: DEFAULT_OPT_ITERATION_FACTOR,
            fixnum_bits: DEFAULT_FIXNUM_BITS,
            cc_command: DEFAULT_CC_COMMAND.to_owned(),
            keep_sources: false,
            backend,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn hot_threshold(mut self, hot_threshold: u32) -> Self {
        self.hot_threshold = hot_threshold;
        self
    }

    pub fn sidetrace_threshold(mut self, sidetrace_threshold: u32) -> Self {
        self.sidetrace_threshold = sidetrace_threshold;
        self
    }

    pub fn max_trace_length(mut self, max_trace_length: usize) -> Self {
        self.max_trace_length = max_trace_length;
        self
    }

    pub fn min_trace_length(mut self, min_trace_length: usize) -> Self {
        self.min_trace_length = min_trace_length;
        self
    }

    pub fn trace_init_size(mut self, trace_init_size: usize) -> Self {
        self.trace_init_size = trace_init_size;
        self
    }

    pub fn reserved_regstack(mut self, reserved_regstack: usize) -> Self {
        self.reserved_regstack = reserved_regstack;
        self
    }

    pub fn trace_failure_threshold(mut self, trace_failure_threshold: u32) -> Self {
        self.trace_failure_threshold = trace_failure_threshold;
        self
    }

    pub fn max_inflight_compiles(mut self, max_inflight_compiles: usize) -> Self {
        self.max_inflight_compiles = max_inflight_compiles;
        self
    }

    pub fn opt_iteration_factor(mut self, opt_iteration_factor: usize) -> Self {
        self.opt_iteration_factor = opt_iteration_factor;
        self
    }

    /// Set the width of the host's fixnums.
    ///
    /// # Panics
    ///
    /// If `fixnum_bits` is not in the range `2..=64`.
    pub fn fixnum_bits(mut self, fixnum_bits: u32) -> Self {
        assert!((2..=64).contains(&fixnum_bits));
        self.fixnum_bits = fixnum_bits;
        self
    }

    pub fn cc_command(mut self, cc_command: &str) -> Self {
        self.cc_command = cc_command.to_owned();
        self
    }

    /// Keep generated C source files around after compilation.
    pub fn keep_sources(mut self, keep_sources: bool) -> Self {
        self.keep_sources = keep_sources;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The smallest representable fixnum.
    pub(crate) fn fixnum_min(&self) -> i64 {
        i64::MIN >> (64 - self.fixnum_bits)
    }

    /// The largest representable fixnum.
    pub(crate) fn fixnum_max(&self) -> i64 {
        i64::MAX >> (64 - self.fixnum_bits)
    }

    /// Does `x` fit in a fixnum?
    pub(crate) fn fixnum_fits(&self, x: i64) -> bool {
        x >= self.fixnum_min() && x <= self.fixnum_max()
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self::new()
    }
}
