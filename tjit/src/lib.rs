//! A trace-based JIT for bytecode interpreters.
//!
//! An interpreter attaches tjit by creating a [JitEngine] and calling [JitEngine::step] before
//! executing each bytecode instruction. tjit watches for hot loops, records the instructions the
//! interpreter executes through them, and compiles the resulting traces to native code which the
//! interpreter then runs instead of interpreting the loop.

#![allow(clippy::new_without_default)]
#![allow(clippy::upper_case_acronyms)]

mod arena;
mod compile;
pub mod config;
mod engine;
pub mod host;
mod log;
mod trace;

pub use config::{Backend, JitConfig};
pub use engine::JitEngine;
