//! Owning handle for a forked and exec'd child process.
//!
//! A [`ProcessHandle`] is the only thing allowed to signal or reap its
//! child. Dropping it while the child is still tracked sends SIGTERM, waits
//! up to the grace period of its [`TerminationPolicy`], escalates to SIGKILL
//! and finally reaps, so no zombie is left behind.
//!
//! Pipe creation and `fork` run under one process-wide lock. Without it, a
//! concurrent spawn can fork while another thread's pipes are still open
//! on both sides, and the second child inherits descriptors that keep the
//! first child's stdin from ever reaching EOF.

// fork(2), signal(2), _exit(2) and `environ` have no safe wrappers
#![allow(unsafe_code)]

use std::ffi::CStr;
use std::future::Future;
use std::io;
use std::mem;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::ptr;
use std::sync::{Mutex, PoisonError};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{self, kill, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execv, fork, ForkResult, Pid};
use tokio::net::unix::pipe;
use tracing::{debug, error, warn};

use super::error::{ProcessError, Result};
use super::options::{ExecPlan, InitFn, ProcessOptions, TerminationPolicy};
use super::pipes::{PendingPipes, PipeSet, Redirect, Stream};
use super::worker::{self, StreamTask};

/// Serialises "create pipes + fork + close child ends" across the process.
static FORK_LOCK: Mutex<()> = Mutex::new(());

const CHILD_ERROR: &[u8] = b"childproc: error ";
const INIT_FAILED: &[u8] = b"childproc: initialization failed: ";
const CHILD_PANICKED: &[u8] = b"childproc: panicked before exec: ";

extern "C" {
    #[link_name = "environ"]
    static mut ENVIRON: *const *const libc::c_char;
}

/// A child process plus the parent's ends of its redirected streams.
///
/// # Example
///
/// ```rust,no_run
/// use childproc::process::{ProcessHandle, ProcessOptions, Redirect};
/// use tokio::io::{AsyncReadExt, AsyncWriteExt};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut child = ProcessHandle::spawn(
///         ProcessOptions::new("/bin/cat").redirect(Redirect::STDIN | Redirect::STDOUT),
///     )?;
///
///     let input = child.make_stdin(|mut tx| async move { tx.write_all(b"hello\n").await })?;
///     let output = child.get_stdout(|mut rx| async move {
///         let mut s = String::new();
///         rx.read_to_string(&mut s).await.map(|_| s)
///     })?;
///
///     input.await?;
///     println!("{}", output.await?);
///     println!("exit: {:?}", child.wait().await?);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<Pid>,
    pipes: PipeSet,
    policy: TerminationPolicy,
}

impl ProcessHandle {
    /// Spawn `program` with `args`, piping the streams in `redirect`.
    pub fn new<I, S>(program: &str, args: I, redirect: Redirect) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::spawn(ProcessOptions::new(program).args(args).redirect(redirect))
    }

    /// Fork and exec a child process as described by `options`.
    ///
    /// Returns once the parent-side bookkeeping is done; stream workers may
    /// be started right away. Errors that happen in the child (working
    /// directory, init callback, exec) are not returned here: the child
    /// writes a message to its stderr and exits with status 1.
    pub fn spawn(mut options: ProcessOptions) -> Result<Self> {
        if !options.program.exists() {
            return Err(ProcessError::ExecutableNotFound(options.program));
        }

        let plan = ExecPlan::prepare(&options)?;
        let environ: Option<Vec<*const libc::c_char>> = plan.envp.as_ref().map(|envp| {
            envp.iter()
                .map(|entry| entry.as_ptr())
                .chain([ptr::null()])
                .collect()
        });
        let init = options.init.take();

        let (pid, pipes) = {
            let _guard = FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

            let pending = PendingPipes::create(options.redirect)?;
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => (child, pending.into_parent()),
                Ok(ForkResult::Child) => exec_child(pending, &plan, environ.as_deref(), init),
                Err(errno) => return Err(ProcessError::ForkFailed(errno)),
            }
        };

        debug!(
            %pid,
            program = %options.program.display(),
            redirect = ?options.redirect,
            "Spawned child process"
        );

        Ok(Self {
            pid: Some(pid),
            pipes,
            policy: options.termination,
        })
    }

    /// The child's pid, or `None` once it has been reaped.
    pub const fn id(&self) -> Option<Pid> {
        self.pid
    }

    /// The streams that were piped at spawn time.
    pub const fn redirect(&self) -> Redirect {
        self.pipes.redirect()
    }

    /// Borrow the parent-side descriptor for `stream`.
    ///
    /// Fails with [`ProcessError::RedirectionNotRequested`] if the stream was
    /// not piped, and [`ProcessError::PipeEndUnavailable`] if a stream worker
    /// already took it.
    pub fn stream_fd(&self, stream: Stream) -> Result<BorrowedFd<'_>> {
        self.pipes.fd(stream)
    }

    /// Write into the child's stdin from a Tokio task.
    ///
    /// `f` receives the write end and owns it; dropping it (when `f`
    /// completes) closes the child's stdin.
    pub fn make_stdin<F, Fut, T, E>(&mut self, f: F) -> Result<StreamTask<T, E>>
    where
        F: FnOnce(pipe::Sender) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let fd = self.pipes.take(Stream::Stdin)?;
        Ok(worker::bridge(Stream::Stdin, fd, f))
    }

    /// Read the child's stdout from a Tokio task.
    pub fn get_stdout<F, Fut, T, E>(&mut self, f: F) -> Result<StreamTask<T, E>>
    where
        F: FnOnce(pipe::Receiver) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let fd = self.pipes.take(Stream::Stdout)?;
        Ok(worker::bridge(Stream::Stdout, fd, f))
    }

    /// Read the child's stderr from a Tokio task.
    pub fn get_stderr<F, Fut, T, E>(&mut self, f: F) -> Result<StreamTask<T, E>>
    where
        F: FnOnce(pipe::Receiver) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let fd = self.pipes.take(Stream::Stderr)?;
        Ok(worker::bridge(Stream::Stderr, fd, f))
    }

    /// Wait for the child to terminate and return its exit status.
    ///
    /// Returns `Ok(None)` if the child was already reaped by an earlier call.
    /// Polls at the policy's poll interval, so dropping the future leaves
    /// the child tracked.
    pub async fn wait(&mut self) -> Result<Option<ExitStatus>> {
        while self.pid.is_some() {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
        Ok(None)
    }

    /// Blocking variant of [`wait`](Self::wait).
    pub fn wait_blocking(&mut self) -> Result<Option<ExitStatus>> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };
        self.reaped(pid, reap(pid, None))
    }

    /// Reap the child if it has terminated, without blocking.
    ///
    /// `Ok(None)` means still running, or nothing left to reap.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };
        self.reaped(pid, reap(pid, Some(WaitPidFlag::WNOHANG)))
    }

    /// Shut the child down the same way dropping the handle does, but
    /// without blocking the thread, and return its exit status.
    pub async fn terminate(&mut self) -> Result<Option<ExitStatus>> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };

        send_signal(pid, Signal::SIGTERM);
        for _ in 0..self.policy.grace_polls() {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }

        warn!(
            %pid,
            grace = ?self.policy.grace_period,
            "Child did not exit after SIGTERM, sending SIGKILL"
        );
        send_signal(pid, Signal::SIGKILL);
        self.wait().await
    }

    fn reaped(
        &mut self,
        pid: Pid,
        result: nix::Result<Option<ExitStatus>>,
    ) -> Result<Option<ExitStatus>> {
        match result {
            Ok(None) => Ok(None),
            Ok(Some(status)) => {
                self.pid = None;
                debug!(%pid, %status, "Reaped child process");
                Ok(Some(status))
            }
            Err(source) => {
                // the pid is no longer ours to signal
                self.pid = None;
                Err(ProcessError::Wait { pid, source })
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };

        // Close our pipe ends first so filters see EOF.
        drop(mem::take(&mut self.pipes));

        send_signal(pid, Signal::SIGTERM);
        for _ in 0..=self.policy.grace_polls() {
            match reap(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(None) => thread::sleep(self.policy.poll_interval),
                Ok(Some(status)) => {
                    debug!(%pid, %status, "Child exited after SIGTERM");
                    return;
                }
                Err(e) => {
                    debug!(%pid, error = %e, "Child already gone");
                    return;
                }
            }
        }

        warn!(
            %pid,
            grace = ?self.policy.grace_period,
            "Child did not exit after SIGTERM, sending SIGKILL"
        );
        send_signal(pid, Signal::SIGKILL);
        if let Err(e) = reap(pid, None) {
            error!(%pid, error = %e, "Failed to reap child after SIGKILL");
        }
    }
}

fn send_signal(pid: Pid, signal: Signal) {
    if let Err(e) = kill(pid, signal) {
        debug!(%pid, ?signal, error = %e, "Failed to signal child");
    }
}

/// `waitpid` translated to a std [`ExitStatus`]; `Ok(None)` while the child
/// is still running under `WNOHANG`.
fn reap(pid: Pid, flags: Option<WaitPidFlag>) -> nix::Result<Option<ExitStatus>> {
    loop {
        match waitpid(pid, flags) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(Some(ExitStatus::from_raw((code & 0xff) << 8)));
            }
            Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                let core = if core_dumped { 0x80 } else { 0 };
                return Ok(Some(ExitStatus::from_raw(signal as i32 | core)));
            }
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(_) if flags.is_some() => return Ok(None),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(e),
        }
    }
}

/// What went wrong between fork and exec.
enum ChildFailure {
    Redirect(Errno),
    Chdir(Errno),
    Init(String),
    Exec(Errno),
}

/// Child side of the fork. Never returns, and never unwinds into the
/// caller's stack frames.
fn exec_child(
    pending: PendingPipes,
    plan: &ExecPlan,
    environ: Option<&[*const libc::c_char]>,
    init: Option<InitFn>,
) -> ! {
    match panic::catch_unwind(AssertUnwindSafe(|| run_child(pending, plan, environ, init))) {
        Ok(failure) => report_failure(plan, failure),
        Err(payload) => child_exit(&[
            CHILD_PANICKED,
            worker::panic_message(payload.as_ref()).as_bytes(),
        ]),
    }
}

/// Redirect, reset signal state, change directory, install the environment,
/// run `init` and exec. Returns only on failure.
fn run_child(
    pending: PendingPipes,
    plan: &ExecPlan,
    environ: Option<&[*const libc::c_char]>,
    init: Option<InitFn>,
) -> ChildFailure {
    if let Err(errno) = pending.attach_child() {
        return ChildFailure::Redirect(errno);
    }

    // The Rust runtime ignores SIGPIPE and exec would carry that over.
    let _ = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) };
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

    if let Some(dir) = &plan.working_dir {
        if let Err(errno) = chdir(dir.as_c_str()) {
            return ChildFailure::Chdir(errno);
        }
    }

    // A plain pointer store: std::env would take a lock some other thread
    // of the parent may have held at fork time. execv reads `environ`, so
    // variables set by `init` still reach the new program.
    if let Some(block) = environ {
        unsafe { ENVIRON = block.as_ptr() };
    }

    if let Some(init) = init {
        match panic::catch_unwind(AssertUnwindSafe(init)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return ChildFailure::Init(format!("{e:#}")),
            Err(payload) => return ChildFailure::Init(worker::panic_message(payload.as_ref())),
        }
    }

    match execv(&plan.program, plan.argv.as_slice()) {
        Err(errno) => ChildFailure::Exec(errno),
        Ok(never) => match never {},
    }
}

fn report_failure(plan: &ExecPlan, failure: ChildFailure) -> ! {
    let mut digits = [0_u8; 12];
    match failure {
        ChildFailure::Redirect(errno) => child_exit(&[
            CHILD_ERROR,
            errno_digits(errno, &mut digits),
            b" redirecting standard streams: ",
            errno.desc().as_bytes(),
        ]),
        ChildFailure::Chdir(errno) => child_exit(&[
            CHILD_ERROR,
            errno_digits(errno, &mut digits),
            b" changing directory to ",
            plan.working_dir.as_deref().map_or(&[][..], CStr::to_bytes),
            b": ",
            errno.desc().as_bytes(),
        ]),
        ChildFailure::Init(message) => child_exit(&[INIT_FAILED, message.as_bytes()]),
        ChildFailure::Exec(errno) => child_exit(&[
            CHILD_ERROR,
            errno_digits(errno, &mut digits),
            b" executing ",
            plan.program.as_bytes(),
            b": ",
            errno.desc().as_bytes(),
        ]),
    }
}

/// Decimal errno number without allocating.
fn errno_digits(errno: Errno, buf: &mut [u8; 12]) -> &[u8] {
    let mut n = (errno as i32).unsigned_abs();
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[start..]
}

/// Write `parts` and a newline to fd 2, then `_exit(1)` without running
/// atexit handlers or destructors inherited from the parent.
fn child_exit(parts: &[&[u8]]) -> ! {
    let stderr = io::stderr();
    for part in parts.iter().copied().chain([b"\n".as_slice()]) {
        write_all(stderr.as_fd(), part);
    }
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return,
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => {}
            Err(_) => return,
        }
    }
}
