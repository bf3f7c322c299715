use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use ndarray::Array1;
use ndarray_npy::WriteNpyExt;
use pottsfit::gauge;
use pottsfit::seq;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

/// Computes the Potts energies of a sequence set under given couplings.
#[derive(Parser)]
pub struct Opts {
    /// Path of the couplings (`P x q^2` float32 `.npy`).
    #[arg(value_hint = ValueHint::FilePath)]
    couplings: PathBuf,
    /// Path of the sequences (one line per sequence).
    #[arg(value_hint = ValueHint::FilePath)]
    seqs: PathBuf,
    /// Alphabet the sequences are written in.
    alpha: String,
    /// Write the energies to this `.npy` file instead of summarizing.
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let couplings = helpers::read_pair_tensor(&self.couplings)?;
        let geom = helpers::geometry_of(&couplings)?;
        let alphabet = helpers::parse_alphabet(&self.alpha, &geom)?;

        let reader = BufReader::new(
            File::open(&self.seqs)
                .context(format!("unable to open '{}'", self.seqs.display()))?,
        );
        let seqs = seq::read_seqs(reader, &geom, &alphabet)?;

        let energies: Array1<f32> = seqs
            .rows()
            .into_iter()
            .map(|row| gauge::pair_energy(&geom, couplings.view(), &row.to_vec()))
            .collect();

        if let Some(output) = &self.output {
            energies
                .write_npy(BufWriter::new(File::create(output).context(format!(
                    "unable to write '{}'",
                    output.display()
                ))?))
                .context(format!("unable to write '{}'", output.display()))?;
        } else {
            let lowest = energies.iter().copied().fold(f32::INFINITY, f32::min);
            let mean: f64 = energies.iter().map(|&e| f64::from(e)).sum::<f64>()
                / energies.len().max(1) as f64;
            println!("sequences: {}", energies.len());
            println!("lowest energy: {lowest}");
            println!("mean energy: {mean}");
        }

        Ok(ExitCode::SUCCESS)
    }
}
