#![allow(missing_docs)]

use clap::Parser;
use pottsfit_cli::{Opts, Subcommand};
use std::process::{ExitCode, Termination};

fn main() -> ExitCode {
    let opts = Opts::parse();

    pottsfit_cli::init_tracing(opts.configuration.verbose);

    match opts.subcommand.run(&opts.configuration) {
        Ok(code) => code,
        result @ Err(_) => result.report(),
    }
}
