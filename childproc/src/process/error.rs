//! Error types for spawning and managing child processes.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use super::pipes::Stream;

/// Errors raised synchronously by [`ProcessHandle`](super::ProcessHandle).
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program path does not reference an existing file.
    #[error("Executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    /// A program path, argument or environment entry cannot be passed to
    /// exec: it holds a NUL byte, or an environment key is empty or holds `=`.
    #[error("Invalid argument {0:?}")]
    InvalidArgument(String),

    /// `pipe2` failed while preparing the redirections.
    #[error("Error {0} creating the pipe")]
    PipeCreationFailed(Errno),

    /// `fork` failed; no process was created.
    #[error("Error {0} forking a new process")]
    ForkFailed(Errno),

    /// The stream was not part of the redirection mask at spawn time.
    #[error("Pipe for {0} not requested when the process was spawned")]
    RedirectionNotRequested(Stream),

    /// The parent-side end of the pipe is no longer held by the handle.
    #[error("Pipe end for {0} is no longer available")]
    PipeEndUnavailable(Stream),

    /// `waitpid` failed for a tracked process.
    #[error("Error {source} waiting for process {pid}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// Result alias for process operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Outcome of a failed stream worker, surfaced when its
/// [`StreamTask`](super::StreamTask) is awaited.
#[derive(Debug, Error)]
pub enum StreamError<E> {
    /// Wrapping the descriptor as an async pipe end failed.
    #[error("Failed to open the {0} pipe: {1}")]
    Open(Stream, #[source] io::Error),

    /// The callback returned its own failure value.
    #[error("Stream callback failed: {0:?}")]
    Callback(E),

    /// The callback panicked with the given message.
    #[error("Stream callback panicked: {0}")]
    Panicked(String),

    /// The runtime shut down before the task finished.
    #[error("Stream task was cancelled")]
    Cancelled,
}

impl<E> StreamError<E> {
    /// The callback's failure value, if that is what this error carries.
    pub fn into_callback(self) -> Option<E> {
        match self {
            Self::Callback(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProcessError::ExecutableNotFound(PathBuf::from("/no/such/thing"));
        assert_eq!(err.to_string(), "Executable not found: /no/such/thing");

        let err = ProcessError::PipeCreationFailed(Errno::EMFILE);
        assert!(err.to_string().contains("creating the pipe"));

        let err = ProcessError::RedirectionNotRequested(Stream::Stderr);
        assert_eq!(
            err.to_string(),
            "Pipe for stderr not requested when the process was spawned"
        );
    }

    #[test]
    fn test_into_callback() {
        let err: StreamError<i32> = StreamError::Callback(42);
        assert_eq!(err.into_callback(), Some(42));

        let err: StreamError<i32> = StreamError::Cancelled;
        assert_eq!(err.into_callback(), None);
    }
}
