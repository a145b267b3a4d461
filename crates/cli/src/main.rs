//! tunebridge command-line executable.

use anyhow::Result;
use clap::Parser;
use tunebridge_compiler::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
