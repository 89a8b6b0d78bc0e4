#![warn(missing_docs)]

//! `fsrepl` binary: serve a replication endpoint or query one.

use anyhow::Result;
use clap::Parser;
use fsrepl_endpoint::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    Cli::parse().run().await
}
