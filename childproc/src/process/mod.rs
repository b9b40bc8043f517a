//! Child process spawning with piped standard streams.
//!
//! This module forks and execs a program, optionally wiring its stdin,
//! stdout and stderr to pipes that are bridged to async callbacks on Tokio
//! tasks. The owning [`ProcessHandle`] terminates and reaps the child when
//! it goes out of scope.

mod error;
mod handle;
mod options;
mod pipes;
mod worker;

pub use error::{ProcessError, Result, StreamError};
pub use handle::ProcessHandle;
pub use options::{InitFn, ProcessOptions, TerminationPolicy};
pub use pipes::{PipeSet, Redirect, Stream};
pub use worker::{PipeEnd, StreamTask};
