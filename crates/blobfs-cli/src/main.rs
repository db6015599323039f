#![warn(missing_docs)]

//! blobfs command line tool.

mod cli;
mod config;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::debug!("blobfs starting");

    Cli::parse().run().await
}
