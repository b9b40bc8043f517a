//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// childproc - run a program as a child process with piped standard streams
#[derive(Parser, Debug)]
#[command(name = "childproc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program and wait for it (no shell is involved)
    Run(RunArgs),

    /// Round-trip distinct values through many concurrent children
    Stress {
        /// Number of children to spawn
        #[arg(short = 'n', long, default_value = "1000")]
        count: usize,

        /// Maximum number of children alive at once
        #[arg(short, long, default_value = "128")]
        concurrency: usize,

        /// Pass-through program that echoes stdin to stdout
        #[arg(long, default_value = "/bin/cat")]
        program: PathBuf,
    },
}

/// Arguments for `childproc run`
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Forward our stdin into the child's stdin
    #[arg(long)]
    pub stdin: bool,

    /// Capture the child's stdout
    #[arg(long)]
    pub stdout: bool,

    /// Capture the child's stderr
    #[arg(long)]
    pub stderr: bool,

    /// Working directory for the child
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Set an environment variable (KEY=VALUE), may be repeated
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Remove an environment variable, may be repeated
    #[arg(long = "env-remove", value_name = "KEY")]
    pub env_remove: Vec<String>,

    /// Start the child with an empty environment
    #[arg(long)]
    pub env_clear: bool,

    /// Terminate the child after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Time between SIGTERM and SIGKILL when terminating
    #[arg(long, value_name = "MS", default_value = "3000")]
    pub grace_period_ms: u64,

    /// Print a JSON summary instead of the child's output
    #[arg(long)]
    pub json: bool,

    /// Full path of the program to run
    pub program: PathBuf,

    /// Arguments passed verbatim to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "childproc", "run", "--stdout", "--env", "A=1=2", "--timeout", "1.5", "/bin/ls", "-la",
            "/tmp",
        ]);

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.stdout);
        assert!(!args.stdin);
        assert_eq!(args.env, vec![("A".to_string(), "1=2".to_string())]);
        assert_eq!(args.timeout, Some(1.5));
        assert_eq!(args.program, PathBuf::from("/bin/ls"));
        assert_eq!(args.args, vec!["-la", "/tmp"]);
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn test_parse_env_pair_rejects_missing_key() {
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn test_parse_stress_defaults() {
        let cli = Cli::parse_from(["childproc", "stress"]);
        let Commands::Stress {
            count,
            concurrency,
            program,
        } = cli.command
        else {
            panic!("expected stress");
        };
        assert_eq!(count, 1000);
        assert_eq!(concurrency, 128);
        assert_eq!(program, PathBuf::from("/bin/cat"));
    }
}
