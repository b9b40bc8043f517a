//! CLI command execution.

use std::collections::HashSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use childproc::process::{ProcessHandle, ProcessOptions, Redirect, Stream, StreamTask};

use super::args::{Cli, Commands, RunArgs};

/// Summary printed by `run --json`.
#[derive(Debug, Serialize)]
struct RunSummary {
    program: PathBuf,
    args: Vec<String>,
    pid: Option<i32>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    timed_out: bool,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

/// Execute the parsed command line and return the exit code to use.
pub async fn execute(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Stress {
            count,
            concurrency,
            program,
        } => stress(count, concurrency, program).await,
    }
}

async fn run(args: RunArgs) -> Result<i32> {
    let mut redirect = Redirect::empty();
    if args.stdin {
        redirect |= Redirect::STDIN;
    }
    if args.stdout {
        redirect |= Redirect::STDOUT;
    }
    if args.stderr {
        redirect |= Redirect::STDERR;
    }

    let mut options = ProcessOptions::new(&args.program)
        .args(args.args.iter().cloned())
        .redirect(redirect)
        .envs(args.env)
        .grace_period(Duration::from_millis(args.grace_period_ms));
    for key in args.env_remove {
        options = options.env_remove(key);
    }
    if args.env_clear {
        options = options.env_clear();
    }
    if let Some(dir) = args.dir {
        options = options.working_dir(dir);
    }

    let started_at = Utc::now();
    let mut child = ProcessHandle::spawn(options)
        .with_context(|| format!("Failed to spawn process: {}", args.program.display()))?;
    let pid = child.id().map(|p| p.as_raw());

    let stdin_task = if args.stdin {
        Some(child.make_stdin(|mut tx| async move {
            tokio::io::copy(&mut tokio::io::stdin(), &mut tx).await?;
            tx.shutdown().await
        })?)
    } else {
        None
    };

    let collect = args.json;
    let stdout_task = if args.stdout {
        Some(child.get_stdout(move |rx| pump(rx, Stream::Stdout, collect))?)
    } else {
        None
    };
    let stderr_task = if args.stderr {
        Some(child.get_stderr(move |rx| pump(rx, Stream::Stderr, collect))?)
    } else {
        None
    };

    let (status, timed_out) = match args.timeout {
        Some(secs) => {
            let deadline = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("Invalid timeout: {secs}"))?;
            let waited = tokio::time::timeout(deadline, child.wait()).await;
            match waited {
                Ok(status) => (status?, false),
                Err(_) => {
                    warn!(?pid, ?deadline, "Timed out, terminating child");
                    (child.terminate().await?, true)
                }
            }
        }
        None => (child.wait().await?, false),
    };
    let finished_at = Utc::now();

    // Our stdin may never reach EOF on its own; only report a writer that
    // already finished.
    if let Some(task) = stdin_task {
        if task.is_finished() {
            if let Err(e) = task.await {
                warn!(error = %e, "Forwarding stdin failed");
            }
        } else {
            debug!("Child exited before stdin was exhausted");
        }
    }
    let stdout = collect_lines(stdout_task).await;
    let stderr = collect_lines(stderr_task).await;

    let status = status.context("Child process was already reaped")?;
    if args.json {
        let summary = RunSummary {
            program: args.program,
            args: args.args,
            pid,
            exit_code: status.code(),
            signal: status.signal(),
            timed_out,
            started_at,
            finished_at,
            stdout,
            stderr,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(exit_code(status))
}

/// Read `rx` line by line, either echoing to our matching stream or
/// collecting the lines.
async fn pump(rx: pipe::Receiver, stream: Stream, collect: bool) -> io::Result<Vec<String>> {
    let mut lines = BufReader::new(rx).lines();
    let mut collected = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if collect {
            collected.push(line);
        } else if stream == Stream::Stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
    Ok(collected)
}

async fn collect_lines(task: Option<StreamTask<Vec<String>, io::Error>>) -> Vec<String> {
    let Some(task) = task else {
        return Vec::new();
    };
    let stream = task.stream();
    match task.await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(%stream, error = %e, "Reading child output failed");
            Vec::new()
        }
    }
}

/// Shell-style exit code: the child's code, or 128 + signal number.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

async fn stress(count: usize, concurrency: usize, program: PathBuf) -> Result<i32> {
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }
    if !program.exists() {
        bail!("Program not found: {}", program.display());
    }

    let limit = Arc::new(Semaphore::new(concurrency));
    let program = Arc::new(program);
    let start = Instant::now();

    let mut tasks = Vec::with_capacity(count);
    for idx in 0..count {
        let limit = Arc::clone(&limit);
        let program = Arc::clone(&program);
        tasks.push(tokio::spawn(async move {
            let _permit = limit.acquire_owned().await?;
            round_trip(&program, idx).await
        }));
    }

    let mut values = HashSet::with_capacity(count);
    let mut failures = 0_usize;
    for task in tasks {
        match task.await {
            Ok(Ok(value)) => {
                values.insert(value);
            }
            Ok(Err(e)) => {
                failures += 1;
                warn!(error = %format!("{e:#}"), "Round trip failed");
            }
            Err(e) => {
                failures += 1;
                warn!(error = %e, "Round trip task failed");
            }
        }
    }

    println!(
        "{count} children, {} distinct values, {failures} failures in {:.2?}",
        values.len(),
        start.elapsed()
    );
    Ok(i32::from(values.len() != count || failures > 0))
}

/// Send `idx` through one pass-through child and parse what comes back.
async fn round_trip(program: &Path, idx: usize) -> Result<usize> {
    let mut child =
        ProcessHandle::spawn(ProcessOptions::new(program).redirect(Redirect::STDIN | Redirect::STDOUT))?;

    let stdin = child.make_stdin(move |mut tx| async move {
        tx.write_all(format!("{idx}\n").as_bytes()).await
    })?;
    let stdout = child.get_stdout(|mut rx| async move {
        let mut out = String::new();
        rx.read_to_string(&mut out).await.map(|_| out)
    })?;

    stdin.await?;
    let out = stdout.await?;
    child.wait().await?;

    out.trim()
        .parse()
        .with_context(|| format!("Child {idx} echoed {out:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn test_round_trip() {
        for idx in [0, 7, 999] {
            assert_eq!(round_trip(Path::new("/bin/cat"), idx).await.unwrap(), idx);
        }
    }

    #[tokio::test]
    async fn test_round_trip_reports_bad_echo() {
        // /bin/true echoes nothing back
        assert!(round_trip(Path::new("/bin/true"), 5).await.is_err());
    }

    #[tokio::test]
    async fn test_stress_small_batch() {
        let code = stress(20, 4, PathBuf::from("/bin/cat")).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_stress_rejects_zero_concurrency() {
        assert!(stress(1, 0, PathBuf::from("/bin/cat")).await.is_err());
    }
}
