//! Pipe bookkeeping for redirected standard streams.
//!
//! Pipes are created in the parent before forking. Both ends start out
//! close-on-exec; after the fork each side keeps exactly one end per
//! stream and drops the other.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

use bitflags::bitflags;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{dup2, pipe2};

use super::error::{ProcessError, Result};

bitflags! {
    /// Which standard streams of the child are connected to pipes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Redirect: u8 {
        /// Write into the child's standard input.
        const STDIN = 1 << 0;
        /// Read from the child's standard output.
        const STDOUT = 1 << 1;
        /// Read from the child's standard error.
        const STDERR = 1 << 2;
    }
}

/// One of the three standard streams of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    pub const ALL: [Self; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// The redirection flag selecting this stream.
    pub const fn flag(self) -> Redirect {
        match self {
            Self::Stdin => Redirect::STDIN,
            Self::Stdout => Redirect::STDOUT,
            Self::Stderr => Redirect::STDERR,
        }
    }

    /// Descriptor slot the stream occupies in the child.
    pub const fn target_fd(self) -> RawFd {
        match self {
            Self::Stdin => libc::STDIN_FILENO,
            Self::Stdout => libc::STDOUT_FILENO,
            Self::Stderr => libc::STDERR_FILENO,
        }
    }

    /// Whether the parent writes into this stream (as opposed to reading it).
    pub const fn parent_writes(self) -> bool {
        matches!(self, Self::Stdin)
    }

    const fn index(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Splits into `(parent_end, child_end)` according to the stream direction.
    fn split(self, stream: Stream) -> (OwnedFd, OwnedFd) {
        if stream.parent_writes() {
            (self.write, self.read)
        } else {
            (self.read, self.write)
        }
    }
}

/// Freshly created pipes, both ends still open, waiting for the fork.
pub(crate) struct PendingPipes {
    redirect: Redirect,
    pipes: [Option<Pipe>; 3],
}

impl PendingPipes {
    /// Creates one close-on-exec pipe per requested stream.
    ///
    /// On failure the pipes created so far are closed when `self` is dropped.
    pub(crate) fn create(redirect: Redirect) -> Result<Self> {
        let mut pending = Self {
            redirect,
            pipes: [None, None, None],
        };
        for stream in Stream::ALL {
            if redirect.contains(stream.flag()) {
                let (read, write) =
                    pipe2(OFlag::O_CLOEXEC).map_err(ProcessError::PipeCreationFailed)?;
                pending.pipes[stream.index()] = Some(Pipe { read, write });
            }
        }
        Ok(pending)
    }

    /// Parent side after a successful fork: keep the parent ends, close the
    /// ends that belong to the child.
    pub(crate) fn into_parent(self) -> PipeSet {
        let mut set = PipeSet {
            redirect: self.redirect,
            ends: [None, None, None],
        };
        for (stream, pipe) in Stream::ALL.into_iter().zip(self.pipes) {
            if let Some(pipe) = pipe {
                let (parent, _child) = pipe.split(stream);
                set.ends[stream.index()] = Some(parent);
            }
        }
        set
    }

    /// Child side after the fork: close the parent ends and move the child
    /// ends onto the standard descriptor slots.
    ///
    /// Only async-signal-safe calls happen here.
    pub(crate) fn attach_child(self) -> nix::Result<()> {
        for (stream, pipe) in Stream::ALL.into_iter().zip(self.pipes) {
            let Some(pipe) = pipe else { continue };
            let (parent, child) = pipe.split(stream);
            drop(parent);

            let target = stream.target_fd();
            if child.as_raw_fd() == target {
                // dup2 onto itself keeps FD_CLOEXEC, clear it by hand
                fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
                let _ = child.into_raw_fd();
            } else {
                dup2(child.as_raw_fd(), target)?;
            }
        }
        Ok(())
    }
}

/// Parent-retained pipe ends of a spawned process.
#[derive(Debug, Default)]
pub struct PipeSet {
    redirect: Redirect,
    ends: [Option<OwnedFd>; 3],
}

impl PipeSet {
    /// The redirection mask the pipes were created for.
    pub const fn redirect(&self) -> Redirect {
        self.redirect
    }

    /// Borrows the parent-side descriptor of `stream`.
    pub fn fd(&self, stream: Stream) -> Result<BorrowedFd<'_>> {
        self.check(stream)?;
        self.ends[stream.index()]
            .as_ref()
            .map(AsFd::as_fd)
            .ok_or(ProcessError::PipeEndUnavailable(stream))
    }

    /// Takes ownership of the parent-side descriptor of `stream`.
    pub fn take(&mut self, stream: Stream) -> Result<OwnedFd> {
        self.check(stream)?;
        self.ends[stream.index()]
            .take()
            .ok_or(ProcessError::PipeEndUnavailable(stream))
    }

    fn check(&self, stream: Stream) -> Result<()> {
        if self.redirect.contains(stream.flag()) {
            Ok(())
        } else {
            Err(ProcessError::RedirectionNotRequested(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_stream_mapping() {
        assert_eq!(Stream::Stdin.target_fd(), 0);
        assert_eq!(Stream::Stdout.target_fd(), 1);
        assert_eq!(Stream::Stderr.target_fd(), 2);
        assert!(Stream::Stdin.parent_writes());
        assert!(!Stream::Stdout.parent_writes());
        assert_eq!(
            Stream::Stdin.flag() | Stream::Stderr.flag(),
            Redirect::STDIN | Redirect::STDERR
        );
    }

    #[test]
    fn test_pipes_only_for_requested_streams() {
        let set = PendingPipes::create(Redirect::STDOUT).unwrap().into_parent();

        assert!(set.fd(Stream::Stdout).is_ok());
        assert!(matches!(
            set.fd(Stream::Stdin),
            Err(ProcessError::RedirectionNotRequested(Stream::Stdin))
        ));
        assert!(matches!(
            set.fd(Stream::Stderr),
            Err(ProcessError::RedirectionNotRequested(Stream::Stderr))
        ));
    }

    #[test]
    fn test_take_twice_is_unavailable() {
        let mut set = PendingPipes::create(Redirect::STDIN).unwrap().into_parent();

        assert!(set.take(Stream::Stdin).is_ok());
        assert!(matches!(
            set.take(Stream::Stdin),
            Err(ProcessError::PipeEndUnavailable(Stream::Stdin))
        ));
        assert!(matches!(
            set.fd(Stream::Stdin),
            Err(ProcessError::PipeEndUnavailable(Stream::Stdin))
        ));
    }

    #[test]
    fn test_parent_end_directions() {
        let pending = PendingPipes::create(Redirect::STDIN | Redirect::STDOUT).unwrap();
        let mut pipes = pending.pipes;

        // stdin: parent writes, child reads
        let (parent, child) = pipes[0].take().unwrap().split(Stream::Stdin);
        let mut w = std::fs::File::from(parent);
        let mut r = std::fs::File::from(child);
        w.write_all(b"in").unwrap();
        drop(w);
        let mut buf = String::new();
        r.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "in");

        // stdout: child writes, parent reads
        let (parent, child) = pipes[1].take().unwrap().split(Stream::Stdout);
        let mut w = std::fs::File::from(child);
        let mut r = std::fs::File::from(parent);
        w.write_all(b"out").unwrap();
        drop(w);
        let mut buf = String::new();
        r.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "out");
    }

    #[test]
    fn test_pipes_are_cloexec() {
        let set = PendingPipes::create(Redirect::STDERR).unwrap().into_parent();
        let fd = set.fd(Stream::Stderr).unwrap();
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }
}
