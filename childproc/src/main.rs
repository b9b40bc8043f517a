//! childproc - spawn a program, bridge its standard streams, and make sure
//! it is gone when we are.
//!
//! Architecture:
//! - `childproc::process` does the fork/exec, pipes and reaping
//! - the CLI here only parses arguments and wires the child to our own stdio

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    childproc::logging::init_tracing(&cli.log_level)?;

    let code = execute(cli).await?;
    std::process::exit(code);
}
