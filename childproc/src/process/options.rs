//! Spawn configuration.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{ProcessError, Result};
use super::pipes::Redirect;

/// Callback run inside the child after fork, before exec.
pub type InitFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// How a process that is still running gets shut down.
///
/// SIGTERM first, then polling every `poll_interval` for up to
/// `grace_period`, then SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(3),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl TerminationPolicy {
    /// Number of non-blocking polls that fit in the grace period.
    pub(crate) fn grace_polls(&self) -> u32 {
        let interval = self.poll_interval.max(Duration::from_millis(1));
        u32::try_from(self.grace_period.as_millis() / interval.as_millis()).unwrap_or(u32::MAX)
    }
}

/// Configuration options for spawning a child process.
///
/// No shell is involved: `args` reach the new program verbatim. To run a
/// shell command, use `/bin/sh` as the program and pass `-c` and the command.
pub struct ProcessOptions {
    /// Path of the executable.
    pub program: PathBuf,

    /// Arguments, excluding the program name.
    pub args: Vec<String>,

    /// Which standard streams are connected to pipes.
    pub redirect: Redirect,

    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set in the child.
    pub env: HashMap<String, String>,

    /// Environment variables to remove in the child.
    pub env_remove: Vec<String>,

    /// Whether to clear the child's environment before applying `env`.
    pub env_clear: bool,

    /// Shutdown behaviour used by `terminate` and on drop.
    pub termination: TerminationPolicy,

    /// Extra initialisation run in the child before exec.
    ///
    /// This runs after `spawn` has already returned in the parent, so
    /// captured state must be owned. A failure is written to the child's
    /// stderr and the child exits with status 1.
    pub init: Option<InitFn>,
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("redirect", &self.redirect)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("env_remove", &self.env_remove)
            .field("env_clear", &self.env_clear)
            .field("termination", &self.termination)
            .field("init", &self.init.is_some())
            .finish()
    }
}

impl ProcessOptions {
    /// Create new options for the given program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            redirect: Redirect::empty(),
            working_dir: None,
            env: HashMap::new(),
            env_remove: Vec::new(),
            env_clear: false,
            termination: TerminationPolicy::default(),
            init: None,
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Connect the given streams to pipes.
    pub fn redirect(mut self, redirect: Redirect) -> Self {
        self.redirect |= redirect;
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Remove an environment variable.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Clear the environment before setting variables.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Set the shutdown behaviour.
    pub fn termination(mut self, policy: TerminationPolicy) -> Self {
        self.termination = policy;
        self
    }

    /// Set the grace period between SIGTERM and SIGKILL.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.termination.grace_period = grace;
        self
    }

    /// Run `init` in the child before exec.
    pub fn init<F>(mut self, init: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }
}

/// Everything the child needs after fork, prepared up front so that the
/// child neither allocates nor touches the process environment lock.
pub(crate) struct ExecPlan {
    pub(crate) program: CString,
    pub(crate) argv: Vec<CString>,
    pub(crate) working_dir: Option<CString>,
    /// Complete `KEY=VALUE` block for the child, or `None` to inherit ours.
    pub(crate) envp: Option<Vec<CString>>,
}

impl ExecPlan {
    pub(crate) fn prepare(options: &ProcessOptions) -> Result<Self> {
        let program = path_cstring(&options.program)?;

        let mut argv = Vec::with_capacity(options.args.len() + 1);
        argv.push(program.clone());
        for arg in &options.args {
            argv.push(CString::new(arg.as_bytes()).map_err(|_| invalid(arg))?);
        }

        let working_dir = options
            .working_dir
            .as_deref()
            .map(path_cstring)
            .transpose()?;

        Ok(Self {
            program,
            argv,
            working_dir,
            envp: env_block(options)?,
        })
    }
}

/// Snapshot of our environment with the configured edits applied, taken in
/// the parent.
fn env_block(options: &ProcessOptions) -> Result<Option<Vec<CString>>> {
    for key in options.env_remove.iter().chain(options.env.keys()) {
        check_env_key(key)?;
    }
    if let Some(value) = options.env.values().find(|v| v.contains('\0')) {
        return Err(invalid(value));
    }
    if !options.env_clear && options.env_remove.is_empty() && options.env.is_empty() {
        return Ok(None);
    }

    let mut vars: BTreeMap<OsString, OsString> = if options.env_clear {
        BTreeMap::new()
    } else {
        std::env::vars_os().collect()
    };
    for key in &options.env_remove {
        vars.remove(OsStr::new(key));
    }
    for (key, value) in &options.env {
        vars.insert(key.into(), value.into());
    }

    vars.into_iter()
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            CString::new(entry).map_err(|e| invalid(&String::from_utf8_lossy(&e.into_vec())))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn check_env_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['=', '\0']) {
        return Err(invalid(key));
    }
    Ok(())
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ProcessError::InvalidArgument(path.display().to_string()))
}

fn invalid(s: &str) -> ProcessError {
    ProcessError::InvalidArgument(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = ProcessOptions::new("/bin/sh")
            .arg("-c")
            .args(["echo", "hi"])
            .redirect(Redirect::STDOUT)
            .redirect(Redirect::STDERR)
            .env("A", "1")
            .env_remove("B")
            .grace_period(Duration::from_millis(250));

        assert_eq!(options.program, PathBuf::from("/bin/sh"));
        assert_eq!(options.args, vec!["-c", "echo", "hi"]);
        assert_eq!(options.redirect, Redirect::STDOUT | Redirect::STDERR);
        assert_eq!(options.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(options.env_remove, vec!["B"]);
        assert_eq!(options.termination.grace_period, Duration::from_millis(250));
        assert!(options.init.is_none());
    }

    #[test]
    fn test_default_policy() {
        let policy = TerminationPolicy::default();
        assert_eq!(policy.grace_period, Duration::from_secs(3));
        assert_eq!(policy.poll_interval, Duration::from_millis(10));
        assert_eq!(policy.grace_polls(), 300);
    }

    #[test]
    fn test_plan_argv_starts_with_program() {
        let plan = ExecPlan::prepare(&ProcessOptions::new("/bin/echo").args(["a", "b c"])).unwrap();
        let argv: Vec<_> = plan.argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(argv, vec!["/bin/echo", "a", "b c"]);
    }

    #[test]
    fn test_plan_rejects_nul() {
        let result = ExecPlan::prepare(&ProcessOptions::new("/bin/echo").arg("a\0b"));
        assert!(matches!(result, Err(ProcessError::InvalidArgument(_))));

        let result = ExecPlan::prepare(&ProcessOptions::new("/bin/echo").env("K=V", "x"));
        assert!(matches!(result, Err(ProcessError::InvalidArgument(_))));
    }

    #[test]
    fn test_plan_rejects_bad_env_remove_keys() {
        for key in ["A=B", "", "A\0B"] {
            let result = ExecPlan::prepare(&ProcessOptions::new("/bin/true").env_remove(key));
            assert!(
                matches!(result, Err(ProcessError::InvalidArgument(_))),
                "key {key:?} was accepted"
            );
        }
    }

    #[test]
    fn test_plan_inherits_environment_without_edits() {
        let plan = ExecPlan::prepare(&ProcessOptions::new("/bin/true")).unwrap();
        assert!(plan.envp.is_none());
    }

    #[test]
    fn test_plan_env_block() {
        let plan = ExecPlan::prepare(
            &ProcessOptions::new("/bin/true")
                .env_clear()
                .env("CHILDPROC_B", "2")
                .env("CHILDPROC_A", "x=y")
                .env_remove("CHILDPROC_B"),
        )
        .unwrap();

        // sets are applied after removals
        let envp: Vec<_> = plan
            .envp
            .unwrap()
            .iter()
            .map(|e| e.to_str().unwrap().to_string())
            .collect();
        assert_eq!(envp, vec!["CHILDPROC_A=x=y", "CHILDPROC_B=2"]);
    }

    #[test]
    fn test_plan_env_remove_drops_inherited_variable() {
        let plan = ExecPlan::prepare(&ProcessOptions::new("/bin/true").env_remove("PATH")).unwrap();
        let envp = plan.envp.unwrap();
        assert!(envp.iter().all(|e| !e.as_bytes().starts_with(b"PATH=")));
    }
}
