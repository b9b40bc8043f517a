//! childproc - run a program as a child process, pipe its standard streams,
//! and make sure it is terminated and reaped.
//!
//! The [`process`] module holds the library; the `childproc` binary is a
//! thin CLI on top of it.

pub mod logging;
pub mod process;
