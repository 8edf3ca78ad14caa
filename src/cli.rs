// src/cli.rs

use clap::{Parser, Subcommand, ValueEnum};

/// Built-in demo graphs for the inspector.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Demo {
    /// Return the constant 5
    Constant,
    /// Allocate a two-field struct and return the pointer
    NewStore,
    /// Call an identity function that inlines away
    Inline,
    /// Branch on a nil-excluded predicate
    IfNil,
    /// Polymorphic identity used at int and at pointer
    PolyId,
}

/// Stoat expression-language compiler core
#[derive(Parser)]
#[command(name = "stoat")]
#[command(version)]
#[command(about = "Stoat optimizing compiler frontend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a demo graph, run the fixpoint and dump node values
    Inspect {
        /// Which demo graph to build
        #[arg(value_enum, value_name = "DEMO")]
        demo: Demo,

        /// Also print per-node liveness
        #[arg(long)]
        live: bool,
    },
    /// Print version information
    Version,
}
