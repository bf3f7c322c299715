use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use pottsfit::bench;
use pottsfit::device::Device;
use pottsfit::kernels::WALKER_GROUP;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::path::PathBuf;
use std::process::ExitCode;

/// Benchmarks Metropolis throughput on the device pool.
#[derive(Parser)]
pub struct Opts {
    /// Path of the target pairwise marginals, used for the geometry.
    #[arg(value_hint = ValueHint::FilePath)]
    bimarg: PathBuf,
    /// Alphabet the sequences are written in.
    alpha: String,
    /// Couplings to sample under: 'zero', 'logscore', or a `.npy` file.
    #[arg(default_value = "logscore", long)]
    couplings: String,
    /// Total walkers across all devices.
    #[arg(default_value_t = 4096, long)]
    nwalkers: usize,
    /// Outer passes to time.
    #[arg(default_value_t = 100, long)]
    passes: usize,
    /// Metropolis proposals per walker per pass, in multiples of L.
    #[arg(default_value_t = 1, long)]
    nsteps: usize,
    /// Number of devices.
    #[arg(default_value_t = 1, long)]
    ndevices: usize,
    /// Master seed.
    #[arg(default_value_t = 1234, long)]
    seed: u64,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let bimarg_target = helpers::read_pair_tensor(&self.bimarg)?;
        let geom = helpers::geometry_of(&bimarg_target)?;
        helpers::parse_alphabet(&self.alpha, &geom)?;

        if self.ndevices == 0 || self.nwalkers % (self.ndevices * WALKER_GROUP) != 0 {
            return Err(anyhow::anyhow!(
                "nwalkers must be a positive multiple of ndevices * {WALKER_GROUP}"
            ));
        }

        let init = helpers::coupling_init(&self.couplings, &geom)?;
        let couplings = helpers::resolve_couplings(&init, &geom, &bimarg_target);

        let mut rng = Pcg64::seed_from_u64(self.seed);
        let per_device = self.nwalkers / self.ndevices;
        let devices = (0..self.ndevices)
            .map(|id| Device::new(id, rng.gen(), geom, per_device, per_device))
            .collect::<pottsfit::error::Result<Vec<_>>>()?;

        let startseq: Vec<u8> = (0..geom.seq_len())
            .map(|_| rng.gen_range(0..geom.num_letters()) as u8)
            .collect();

        let report = bench::benchmark(&devices, &couplings, &startseq, self.passes, self.nsteps)?;

        println!("elapsed: {:?}", report.elapsed);
        println!("time per pass: {:?}", report.per_pass);
        println!("MC steps per second: {:.3e}", report.steps_per_second);

        Ok(ExitCode::SUCCESS)
    }
}
