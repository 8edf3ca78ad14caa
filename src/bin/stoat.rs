// src/bin/stoat.rs

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stoat::cli::{Cli, Commands};
use stoat::commands::inspect::inspect_demo;
use stoat::commands::version::print_version;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect { demo, live } => inspect_demo(demo, live),
        Commands::Version => print_version(),
    }
}
