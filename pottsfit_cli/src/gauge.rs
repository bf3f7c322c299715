use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueEnum, ValueHint};
use pottsfit::gauge;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Clone, Copy, ValueEnum)]
enum Transform {
    /// Zero-mean gauge plus even redistribution of the removed fields; the
    /// canonical form the fitter uses between iterations.
    Canonical,
    /// Zero-mean gauge; fields go to the `--fields` output.
    Zero,
    /// Zero-J gauge, preserving per-sequence energies exactly; fields go
    /// to the `--fields` output.
    ZeroJ,
}

/// Re-gauges a coupling tensor.
#[derive(Parser)]
pub struct Opts {
    /// Path of the input couplings (`P x q^2` float32 `.npy`).
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Path of the transformed couplings.
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,
    /// Which gauge to fix.
    #[arg(default_value = "canonical", long, value_enum)]
    transform: Transform,
    /// Where to write the extracted field tensor (`L x q` `.npy`).
    #[arg(long, value_hint = ValueHint::FilePath)]
    fields: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let couplings = helpers::read_pair_tensor(&self.input)?;
        let geom = helpers::geometry_of(&couplings)?;

        let (fields, transformed) = match self.transform {
            Transform::Canonical => {
                let (fields, centered) = gauge::zero_gauge(&geom, couplings.view());
                let even = gauge::fieldless_even(&geom, fields.view(), centered.view());
                (None, even)
            }
            Transform::Zero => {
                let (fields, centered) = gauge::zero_gauge(&geom, couplings.view());
                (Some(fields), centered)
            }
            Transform::ZeroJ => {
                let (fields, centered) = gauge::zero_j_gauge(&geom, couplings.view());
                (Some(fields), centered)
            }
        };

        helpers::write_pair_tensor(&self.output, &transformed)?;
        if let (Some(fields), Some(path)) = (fields, &self.fields) {
            helpers::write_pair_tensor(path, &fields)?;
        }

        Ok(ExitCode::SUCCESS)
    }
}
