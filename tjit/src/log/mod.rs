//! The implementation of the `TJD_LOG*` environment variables.

use std::{error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should tjit's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log state transitions of traces and side exits.
    TraceTransition,
    /// Log JIT events (e.g. start/stop recording).
    JITEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        Self::from_env_str(std::env::var("TJD_LOG").ok().as_deref())
    }

    fn from_env_str(s: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let Some(s) = s else {
            return Ok(Self {
                path: None,
                level: Verbosity::Error,
            });
        };
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // If there's an existing log file, truncate (i.e. empty it), so that later
                    // appends to the log aren't appending to a previous log run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("TJD_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid TJD_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("TJD_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "tjit-error",
                Verbosity::Warning => "tjit-warning",
                Verbosity::TraceTransition => "tjit-trace-transition",
                Verbosity::JITEvent => "tjit-jit-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

#[derive(Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The IR as recorded.
    PreOpt,
    /// The IR after it has been optimised.
    PostOpt,
    /// The C source handed to the toolchain.
    CSource,
}

mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let mut log_phases = HashSet::new();
        if let Ok(x) = env::var("TJD_LOG_IR") {
            let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, phases] => (*path, *phases),
                [phases] => ("-", *phases),
                _ => panic!(
                    "TJD_LOG_IR must be of the format '[<path>:]<irstage_1>[,...,<irstage_n>]'"
                ),
            };
            for x in phases.split(',') {
                match IRPhase::from_str(x) {
                    Ok(p) => {
                        log_phases.insert(p);
                    }
                    Err(e) => panic!("{e}"),
                }
            }
            if path != "-" {
                // If there's an existing log file, truncate (i.e. empty it), so that later
                // appends to the log aren't appending to a previous log run.
                File::create(path).ok();
            }
            Some((path.to_string(), log_phases))
        } else {
            None
        }
    });

    impl IRPhase {
        pub(super) fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "jit-pre-opt" => Ok(Self::PreOpt),
                "jit-post-opt" => Ok(Self::PostOpt),
                "c-source" => Ok(Self::CSource),
                _ => Err(format!("Invalid TJD_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        if let Some(true) = LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)) {
            return true;
        }
        false
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
