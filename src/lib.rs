//! Measure wall, user and kernel time plus peak memory of a child process.
//!
//! Peak memory is captured inside the target by an injected agent module and
//! sent back over a one-shot [`channel`]; times and the exit code come from the
//! OS once the target has exited. Results go to the console or, one row per
//! run, to a log file shared safely between concurrent watchers.

pub mod arch;
pub mod channel;
pub mod cmdline;
pub mod config;
pub mod format;
pub mod inject;
pub mod launcher;
pub mod logfile;
pub mod probe;
pub mod snapshot;
