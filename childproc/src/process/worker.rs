//! Stream workers: Tokio tasks bridging a pipe end to a user callback.
//!
//! Each worker owns its pipe end. The callback receives it by value, so the
//! descriptor is closed as soon as the callback's future completes, whether
//! it succeeded or failed. For stdin that close is what signals end of input
//! to the child.

use std::any::Any;
use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::net::unix::pipe;
use tokio::task::{JoinError, JoinHandle};

use super::error::StreamError;
use super::pipes::Stream;

/// An async pipe end that can be built from a parent-side descriptor.
pub trait PipeEnd: Sized + Send + 'static {
    fn open(fd: OwnedFd) -> io::Result<Self>;
}

impl PipeEnd for pipe::Sender {
    fn open(fd: OwnedFd) -> io::Result<Self> {
        Self::from_owned_fd(fd)
    }
}

impl PipeEnd for pipe::Receiver {
    fn open(fd: OwnedFd) -> io::Result<Self> {
        Self::from_owned_fd(fd)
    }
}

/// Deferred result of a stream worker.
///
/// Await it to get the callback's value or its failure. Failures are only
/// ever reported here.
#[derive(Debug)]
#[must_use = "a stream task reports its callback's failure only when awaited"]
pub struct StreamTask<T, E> {
    stream: Stream,
    handle: JoinHandle<Result<T, StreamError<E>>>,
}

impl<T, E> StreamTask<T, E> {
    /// The stream this task is bridging.
    pub const fn stream(&self) -> Stream {
        self.stream
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T, E> Future for StreamTask<T, E> {
    type Output = Result<T, StreamError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(join_failure(e))))
    }
}

fn join_failure<E>(e: JoinError) -> StreamError<E> {
    match e.try_into_panic() {
        Ok(payload) => StreamError::Panicked(panic_message(payload.as_ref())),
        Err(_) => StreamError::Cancelled,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Spawns the task for one stream. Shared by stdin, stdout and stderr; the
/// pipe-end type `P` carries the direction.
pub(crate) fn bridge<P, F, Fut, T, E>(stream: Stream, fd: OwnedFd, f: F) -> StreamTask<T, E>
where
    P: PipeEnd,
    F: FnOnce(P) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let handle = tokio::spawn(async move {
        let end = P::open(fd).map_err(|e| StreamError::Open(stream, e))?;
        f(end).await.map_err(StreamError::Callback)
    });
    StreamTask { stream, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe as os_pipe;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let (read, write) = os_pipe().unwrap();

        let writer = bridge(Stream::Stdin, write, |mut tx: pipe::Sender| async move {
            tx.write_all(b"hello\n").await?;
            Ok::<_, io::Error>(())
        });
        let reader = bridge(Stream::Stdout, read, |mut rx: pipe::Receiver| async move {
            let mut s = String::new();
            rx.read_to_string(&mut s).await?;
            Ok::<_, io::Error>(s)
        });

        writer.await.unwrap();
        assert_eq!(reader.await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_callback_error_is_surfaced() {
        let (_read, write) = os_pipe().unwrap();

        let task = bridge(Stream::Stdin, write, |_tx: pipe::Sender| async move {
            Err::<(), _>(17_u64)
        });

        assert_eq!(task.stream(), Stream::Stdin);
        match task.await {
            Err(StreamError::Callback(v)) => assert_eq!(v, 17),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_surfaced() {
        let (read, _write) = os_pipe().unwrap();

        let task = bridge(Stream::Stderr, read, |_rx: pipe::Receiver| async move {
            if true {
                panic!("reader blew up");
            }
            Ok::<(), ()>(())
        });

        match task.await {
            Err(StreamError::Panicked(message)) => assert_eq!(message, "reader blew up"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_descriptor_kind_fails_open() {
        let file = tempfile::tempfile().unwrap();

        let task = bridge(Stream::Stdout, OwnedFd::from(file), |_rx: pipe::Receiver| async move {
            Ok::<(), ()>(())
        });

        assert!(matches!(task.await, Err(StreamError::Open(Stream::Stdout, _))));
    }

    #[tokio::test]
    async fn test_writer_close_signals_eof() {
        let (read, write) = os_pipe().unwrap();

        let writer = bridge(Stream::Stdin, write, |mut tx: pipe::Sender| async move {
            tx.write_all(b"partial").await?;
            Err::<(), io::Error>(io::Error::other("stop early"))
        });
        let reader = bridge(Stream::Stdout, read, |mut rx: pipe::Receiver| async move {
            let mut buf = Vec::new();
            rx.read_to_end(&mut buf).await?;
            Ok::<_, io::Error>(buf)
        });

        assert!(matches!(writer.await, Err(StreamError::Callback(_))));
        assert_eq!(reader.await.unwrap(), b"partial");
    }
}
