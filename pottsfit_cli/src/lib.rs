#![allow(clippy::missing_errors_doc)]
#![allow(missing_docs)]

mod benchmark;
mod energies;
mod gauge;
mod helpers;
mod infer;

use anyhow::Result;
use clap::Parser;
use enum_dispatch::enum_dispatch;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
pub struct GlobalConfiguration {
    /// Increase log verbosity; repeat for debug output.
    #[arg(action = clap::ArgAction::Count, long, short)]
    pub verbose: u8,
}

/// Installs the log subscriber; `RUST_LOG` overrides the verbosity flag.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

#[enum_dispatch]
pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[enum_dispatch(Subcommand)]
#[derive(Parser)]
pub enum SubcommandEnum {
    Benchmark(benchmark::Opts),
    Energies(energies::Opts),
    Gauge(gauge::Opts),
    Infer(infer::Opts),
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    about,
    disable_help_subcommand = true,
    name = "pottsfit",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}
