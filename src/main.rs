//! # scm-sync
//!
//! Entry point for every role of the sync engine.

use std::process::ExitCode;

use clap::Parser;
use scm_sync::cli::{Cli, run};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
