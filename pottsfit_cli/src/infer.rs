use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueHint};
use pottsfit::config::{McmcConfig, NewtonConfig, NewtonPolicy, RunConfig};
use pottsfit::geometry::Geometry;
use pottsfit::run::{Inference, PreoptPopulation, StartSeq};
use pottsfit::seq;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Fits Potts couplings so the model's pairwise marginals match a target.
#[derive(Parser)]
pub struct Opts {
    /// Path of the target pairwise marginals (`P x q^2` float32 `.npy`).
    #[arg(value_hint = ValueHint::FilePath)]
    bimarg: PathBuf,
    /// Alphabet the sequences are written in.
    alpha: String,
    /// Output directory for per-iteration run state.
    #[arg(default_value = "output", long, value_hint = ValueHint::DirPath)]
    outdir: PathBuf,
    /// Initial couplings: 'zero', 'logscore', or a `.npy` file.
    #[arg(default_value = "zero", long)]
    couplings: String,
    /// Start sequence: letters over the alphabet, or 'rand'. May be
    /// omitted when pre-optimization generates the population.
    #[arg(long)]
    startseq: Option<String>,
    /// Initial Newton learning rate.
    #[arg(default_value_t = 4e-4, long)]
    gamma: f32,
    /// Newton iterations per refinement phase.
    #[arg(default_value_t = 32, long)]
    newtonsteps: u32,
    /// Pseudocount damping of the Newton update denominator.
    #[arg(default_value_t = 1e-3, long)]
    pcdamping: f32,
    /// Pseudocount added to the target marginals before fitting.
    #[arg(default_value_t = 0.0, long)]
    pc: f32,
    /// Accept every Newton step instead of requiring a non-increasing SSR.
    #[arg(long)]
    always_accept: bool,
    /// Shrinkage regularization 'fn_lmbda,fn_s'.
    #[arg(long)]
    regularize: Option<String>,
    /// Equilibration passes per macro-iteration.
    #[arg(default_value_t = 128, long)]
    equiltime: usize,
    /// Passes between post-equilibration snapshots.
    #[arg(default_value_t = 8, long)]
    sampletime: usize,
    /// Snapshots per macro-iteration.
    #[arg(default_value_t = 4, long)]
    nsamples: usize,
    /// Metropolis proposals per walker per pass, in multiples of L.
    #[arg(default_value_t = 1, long)]
    nsteps: usize,
    /// Total walkers across all devices.
    #[arg(default_value_t = 4096, long)]
    nwalkers: usize,
    /// Save marginals every N equilibration passes (0 = off).
    #[arg(default_value_t = 0, long)]
    trackequil: usize,
    /// Inverse-temperature ladder, comma separated, primary first.
    #[arg(long)]
    tempering: Option<String>,
    /// Temperature-swap proposals per pass when tempering.
    #[arg(default_value_t = 0, long)]
    nswaps: usize,
    /// Macro-iterations of the sample-refine loop.
    #[arg(default_value_t = 10, long)]
    mcmcsteps: usize,
    /// Number of devices to partition the walkers over.
    #[arg(default_value_t = 1, long)]
    ndevices: usize,
    /// Master seed for all PRNGs.
    #[arg(default_value_t = 1234, long)]
    seed: u64,
    /// Keep walker states across macro-iterations instead of resetting to
    /// the start sequence.
    #[arg(long)]
    noreset: bool,
    /// Pre-optimize against an initial population: 'rand', 'logscore', or
    /// a directory holding `seqs-k` files from a previous run.
    #[arg(long)]
    preopt: Option<String>,
    /// Plain equilibration passes before the main loop (alternative to
    /// pre-optimization).
    #[arg(default_value_t = 0, long)]
    preequiltime: usize,
}

impl Opts {
    fn population(
        &self,
        geom: &Geometry,
        alphabet: &pottsfit::seq::Alphabet,
        cfg: &RunConfig,
    ) -> Result<Option<PreoptPopulation>> {
        let Some(spec) = &self.preopt else {
            return Ok(None);
        };

        let population = match spec.as_str() {
            "rand" => PreoptPopulation::Random,
            "logscore" => PreoptPopulation::IndependentLogOdds,
            dir => {
                let dir = Path::new(dir);
                let mut per_device = Vec::with_capacity(cfg.ndevices);
                for k in 0..cfg.ndevices {
                    let path = dir.join(format!("seqs-{k}"));
                    let reader = BufReader::new(
                        File::open(&path)
                            .context(format!("unable to open '{}'", path.display()))?,
                    );
                    per_device.push(seq::read_seqs(reader, geom, alphabet)?);
                }
                PreoptPopulation::Given(per_device)
            }
        };
        Ok(Some(population))
    }
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let bimarg_target = helpers::read_pair_tensor(&self.bimarg)?;
        let geom = helpers::geometry_of(&bimarg_target)?;
        let alphabet = helpers::parse_alphabet(&self.alpha, &geom)?;
        let bimarg_target = helpers::apply_pseudocount(bimarg_target, self.pc);

        let tempering = self
            .tempering
            .as_deref()
            .map(helpers::parse_ladder)
            .transpose()?;
        let regularization = self
            .regularize
            .as_deref()
            .map(helpers::parse_regularization)
            .transpose()?;

        let cfg = RunConfig {
            mcmc: McmcConfig {
                equiltime: self.equiltime,
                sampletime: self.sampletime,
                nsamples: self.nsamples,
                nsteps: self.nsteps,
                trackequil: self.trackequil,
                tempering,
                nswaps: self.nswaps,
            },
            newton: NewtonConfig {
                gamma0: self.gamma,
                newton_steps: self.newtonsteps,
                pcdamping: self.pcdamping,
                regularization,
                policy: if self.always_accept {
                    NewtonPolicy::Always
                } else {
                    NewtonPolicy::Monotone
                },
            },
            nwalkers: self.nwalkers,
            ndevices: self.ndevices,
            seed: self.seed,
            mcmcsteps: self.mcmcsteps,
            resetseqs: !self.noreset,
            preopt: self.preopt.is_some(),
            preequiltime: self.preequiltime,
        };

        std::fs::create_dir_all(&self.outdir)?;
        serde_json::to_writer_pretty(
            BufWriter::new(File::create(self.outdir.join("config.json"))?),
            &cfg,
        )?;

        let couplings = helpers::coupling_init(&self.couplings, &geom)?;
        let startseq = match self.startseq.as_deref() {
            Some("rand") => StartSeq::Random,
            Some(text) => StartSeq::Given(alphabet.encode(text)?),
            None if self.preopt.is_some() => StartSeq::FromPreopt,
            None => {
                return Err(anyhow!(
                    "a start sequence is required unless pre-optimization generates one"
                ))
            }
        };
        let population = self.population(&geom, &alphabet, &cfg)?;

        let mut inference = Inference::new(
            geom,
            alphabet.clone(),
            cfg,
            bimarg_target,
            Some(&self.outdir),
        )?;
        let result = inference.run(couplings, startseq, population)?;

        println!(
            "final start seq: {}",
            alphabet.decode(&result.startseq)
        );
        println!("run state written to '{}'", self.outdir.display());

        Ok(ExitCode::SUCCESS)
    }
}
