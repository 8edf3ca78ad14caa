// src/commands/version.rs

use std::process::ExitCode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) { "debug" } else { "release" }
}

pub fn print_version() -> ExitCode {
    println!("stoat {} ({})", VERSION, build_profile());
    ExitCode::SUCCESS
}
