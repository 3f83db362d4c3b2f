#![warn(missing_docs)]

//! `refmirror` operator binary.

use anyhow::Result;
use clap::Parser;
use refmirror_repl::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "refmirror starting");
    cli.run().await
}
