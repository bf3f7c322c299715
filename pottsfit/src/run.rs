//! The macro-orchestrator.
//!
//! The outer loop alternates one full MCMC sampling phase with one Newton
//! refinement phase: gauge-normalize the couplings, optionally reset the
//! walkers to the start sequence, sample, checkpoint, refine, then pick a
//! uniformly random sequence from the sample set as the next seed.

use crate::buffers::{Role, SeqBuf};
use crate::checkpoint::{MacroRecord, RunWriter};
use crate::config::RunConfig;
use crate::device::{wait_all, Device};
use crate::error::{Error, Result};
use crate::gauge;
use crate::geometry::Geometry;
use crate::mcmc::McmcDriver;
use crate::newton;
use crate::observables;
use crate::seq::Alphabet;
use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::path::Path;
use tracing::info;

/// How the initial couplings are obtained.
#[derive(Clone, Debug)]
pub enum CouplingInit {
    /// All couplings zero.
    Zero,
    /// Independent log-odds of the target's single-site marginals,
    /// distributed into the fieldless-even gauge.
    IndependentLogOdds,
    /// Couplings supplied by the caller (e.g. loaded from a previous run).
    Given(Array2<f32>),
}

/// How the start sequence is obtained.
#[derive(Clone, Debug)]
pub enum StartSeq {
    /// A fixed sequence supplied by the caller.
    Given(Vec<u8>),
    /// A uniformly random sequence drawn from the host PRNG.
    Random,
    /// Adopt the first sequence generated during pre-optimization.
    FromPreopt,
}

/// The initial population pre-optimization refines against.
#[derive(Clone, Debug)]
pub enum PreoptPopulation {
    /// Uniformly random sequences.
    Random,
    /// Sequences sampled site-independently from the target's single-site
    /// marginals.
    IndependentLogOdds,
    /// Sequences supplied by the caller, one array per device.
    Given(Vec<Array2<u8>>),
}

/// Final state of an inference run.
#[derive(Debug)]
pub struct FitResult {
    /// Couplings after the last refinement phase.
    pub couplings: Array2<f32>,
    /// Seed sequence the next macro-iteration would start from.
    pub startseq: Vec<u8>,
}

/// Owns the device pool and runs the outer inference loop.
#[derive(Debug)]
pub struct Inference {
    geom: Geometry,
    alphabet: Alphabet,
    cfg: RunConfig,
    bimarg_target: Array2<f32>,
    devices: Vec<Device>,
    driver: McmcDriver,
    rng: Pcg64,
    writer: Option<RunWriter>,
}

impl Inference {
    /// Validates the configuration, spawns the device pool and uploads the
    /// target marginals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for any configuration fault, before any
    /// device work happens.
    pub fn new(
        geom: Geometry,
        alphabet: Alphabet,
        cfg: RunConfig,
        bimarg_target: Array2<f32>,
        outdir: Option<&Path>,
    ) -> Result<Self> {
        if alphabet.len() != geom.num_letters() {
            return Err(Error::Config(format!(
                "alphabet has {} letters, geometry expects {}",
                alphabet.len(),
                geom.num_letters()
            )));
        }
        cfg.validate(&geom, bimarg_target.view())?;

        let mut rng = Pcg64::seed_from_u64(cfg.seed);
        let mut seeds = Vec::with_capacity(cfg.ndevices);
        while seeds.len() < cfg.ndevices {
            let seed: u64 = rng.gen();
            if !seeds.contains(&seed) {
                seeds.push(seed);
            }
        }

        let nseq_small = cfg.walkers_per_device();
        let nseq_large = cfg.samples_per_device();
        let devices = seeds
            .into_iter()
            .enumerate()
            .map(|(id, seed)| Device::new(id, seed, geom, nseq_small, nseq_large))
            .collect::<Result<Vec<_>>>()?;
        for device in &devices {
            device.set_bimarg_target(bimarg_target.clone())?;
        }

        let driver = McmcDriver::new(cfg.mcmc.clone());
        driver.init_tempering(&devices, &mut rng)?;

        let writer = outdir.map(RunWriter::new).transpose()?;

        info!(
            walkers = cfg.nwalkers,
            devices = cfg.ndevices,
            seq_len = geom.seq_len(),
            letters = geom.num_letters(),
            "inference set up"
        );

        Ok(Self {
            geom,
            alphabet,
            cfg,
            bimarg_target,
            devices,
            driver,
            rng,
            writer,
        })
    }

    /// The device pool, mainly for inspection in tests.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Runs pre-optimization (or pre-equilibration) and then the full
    /// sample-refine loop.
    ///
    /// # Errors
    ///
    /// Configuration faults abort immediately; [`Error::Divergence`] from
    /// a refinement phase aborts the run; device faults are propagated.
    pub fn run(
        &mut self,
        couplings: CouplingInit,
        startseq: StartSeq,
        population: Option<PreoptPopulation>,
    ) -> Result<FitResult> {
        let mut couplings = self.initial_couplings(couplings)?;
        if let Some(writer) = &self.writer {
            writer.write_start_couplings(couplings.view())?;
        }

        let mut startseq = match startseq {
            StartSeq::Given(seq) => {
                if seq.len() != self.geom.seq_len()
                    || seq.iter().any(|&s| usize::from(s) >= self.geom.num_letters())
                {
                    return Err(Error::Config("start sequence does not fit the geometry".to_owned()));
                }
                Some(seq)
            }
            StartSeq::Random => Some(
                (0..self.geom.seq_len())
                    .map(|_| {
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            self.rng.gen_range(0..self.geom.num_letters()) as u8
                        }
                    })
                    .collect(),
            ),
            StartSeq::FromPreopt => None,
        };

        if self.cfg.preopt {
            let population = population.ok_or_else(|| {
                Error::Config("pre-optimization requires an initial population".to_owned())
            })?;
            let first = self.load_population(&population)?;
            if startseq.is_none() {
                // adopt the first generated sequence as the seed
                startseq = Some(first);
            }
            couplings = self.preopt(couplings)?;
        } else if self.cfg.preequiltime > 0 {
            self.preequilibrate(&mut couplings, startseq.as_deref())?;
        } else {
            info!("no pre-optimization");
        }

        let mut startseq = startseq
            .ok_or_else(|| Error::Config("inference requires a start sequence".to_owned()))?;

        for i in 0..self.cfg.mcmcsteps {
            let name = format!("run_{i}");
            let (next_seq, next_couplings) = self.macro_step(&name, &startseq, couplings)?;
            startseq = next_seq;
            couplings = next_couplings;
        }

        Ok(FitResult {
            couplings,
            startseq,
        })
    }

    /// Builds and canonicalizes the initial couplings.
    fn initial_couplings(&self, init: CouplingInit) -> Result<Array2<f32>> {
        let shape = (self.geom.num_pairs(), self.geom.num_states());
        let couplings = match init {
            CouplingInit::Zero => {
                info!("initial couplings: zero");
                Array2::zeros(shape)
            }
            CouplingInit::IndependentLogOdds => {
                info!("initial couplings: independent log-odds");
                logscore_couplings(&self.geom, self.bimarg_target.view())
            }
            CouplingInit::Given(given) => {
                if given.dim() != shape {
                    return Err(Error::Config(format!(
                        "initial couplings have shape {:?}, geometry needs {shape:?}",
                        given.dim()
                    )));
                }
                given
            }
        };

        // canonicalize once at startup, as at the head of every
        // macro-iteration
        let (fields, centered) = gauge::zero_gauge(&self.geom, couplings.view());
        Ok(gauge::fieldless_even(
            &self.geom,
            fields.view(),
            centered.view(),
        ))
    }

    /// Fills the per-device large buffers with the pre-optimization
    /// population and returns the first sequence.
    fn load_population(&mut self, population: &PreoptPopulation) -> Result<Vec<u8>> {
        let count = self.cfg.samples_per_device();
        let mut first: Option<Vec<u8>> = None;

        match population {
            PreoptPopulation::Given(per_device) => {
                if per_device.len() != self.devices.len() {
                    return Err(Error::Config(format!(
                        "{} sequence sets for {} devices",
                        per_device.len(),
                        self.devices.len()
                    )));
                }
                for (device, seqs) in self.devices.iter().zip(per_device) {
                    if seqs.nrows() != count {
                        return Err(Error::Config(format!(
                            "need {count} restart sequences per device, got {}",
                            seqs.nrows()
                        )));
                    }
                    device.set_seqs(SeqBuf::Large, seqs.view())?;
                    first.get_or_insert_with(|| seqs.row(0).to_vec());
                }
            }
            PreoptPopulation::Random => {
                info!("generating random pre-optimization sequences");
                for device in &self.devices {
                    let seqs = Array2::from_shape_fn((count, self.geom.seq_len()), |_| {
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            self.rng.gen_range(0..self.geom.num_letters()) as u8
                        }
                    });
                    device.set_seqs(SeqBuf::Large, seqs.view())?;
                    first.get_or_insert_with(|| seqs.row(0).to_vec());
                }
            }
            PreoptPopulation::IndependentLogOdds => {
                info!("generating log-odds pre-optimization sequences");
                let marg =
                    observables::single_site_marginals(&self.geom, self.bimarg_target.view());
                let cumulative: Vec<Vec<f32>> = marg
                    .rows()
                    .into_iter()
                    .map(|row| {
                        row.iter()
                            .scan(0.0_f32, |acc, &p| {
                                *acc += p;
                                Some(*acc)
                            })
                            .collect()
                    })
                    .collect();

                for device in &self.devices {
                    let seqs = Array2::from_shape_fn((count, self.geom.seq_len()), |(_, i)| {
                        let u = self.rng.gen_range(0.0..1.0_f32);
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            cumulative[i].iter().position(|&c| u < c).unwrap_or(
                                self.geom.num_letters() - 1,
                            ) as u8
                        }
                    });
                    device.set_seqs(SeqBuf::Large, seqs.view())?;
                    first.get_or_insert_with(|| seqs.row(0).to_vec());
                }
            }
        }

        first.ok_or_else(|| Error::Config("device pool is empty".to_owned()))
    }

    /// One-shot Newton refinement over the loaded population.
    fn preopt(&mut self, couplings: Array2<f32>) -> Result<Array2<f32>> {
        info!("pre-optimization");

        for device in &self.devices {
            device.set_couplings(Role::Main, couplings.clone())?;
            device.calc_bicounts(SeqBuf::Large, false)?;
        }
        let bicount = observables::sum_arrays(wait_all(
            self.devices.iter().map(Device::bicount).collect(),
        )?);
        let bimarg = observables::normalize_bicounts(bicount.view());

        let stats = observables::fit_stats(self.bimarg_target.view(), bimarg.view());
        info!(
            ferr = stats.ferr,
            ssr = stats.ssr,
            wdf = stats.wdf,
            "pre-optimization population statistics"
        );

        if let Some(writer) = &self.writer {
            let seqs = wait_all(
                self.devices
                    .iter()
                    .map(|d| d.seqs(SeqBuf::Large))
                    .collect(),
            )?;
            writer.write_preopt_init(
                couplings.view(),
                bimarg.view(),
                bicount.view(),
                &seqs,
                &self.alphabet,
            )?;
        }

        let outcome = newton::refine(
            &self.devices,
            self.bimarg_target.view(),
            &bimarg,
            &self.cfg.newton,
        )?;
        if let Some(writer) = &self.writer {
            writer.write_preopt_result(outcome.couplings.view(), outcome.bimarg.view())?;
        }

        Ok(outcome.couplings)
    }

    /// Pre-equilibration: plain MCMC without refinement before the main
    /// loop.
    fn preequilibrate(
        &mut self,
        couplings: &mut Array2<f32>,
        startseq: Option<&[u8]>,
    ) -> Result<()> {
        info!(passes = self.cfg.preequiltime, "pre-equilibration");

        let (fields, centered) = gauge::zero_gauge(&self.geom, couplings.view());
        *couplings = gauge::fieldless_even(&self.geom, fields.view(), centered.view());

        if self.cfg.resetseqs {
            let seq = startseq.ok_or_else(|| {
                Error::Config("pre-equilibration with resetseqs requires a start sequence".to_owned())
            })?;
            for device in &self.devices {
                device.fill_seqs(seq)?;
            }
        }
        for device in &self.devices {
            device.set_couplings(Role::Main, couplings.clone())?;
        }

        let passes = self.cfg.preequiltime;
        self.driver
            .equilibrate_only(&self.devices, &mut self.rng, passes)
    }

    /// One macro-iteration: gauge fix, sample, checkpoint, refine, reseed.
    fn macro_step(
        &mut self,
        name: &str,
        startseq: &[u8],
        couplings: Array2<f32>,
    ) -> Result<(Vec<u8>, Array2<f32>)> {
        info!(name, "macro-iteration");

        // re-center the gauge; a no-op on sample statistics but keeps
        // energies O(1) across iterations
        let (fields, centered) = gauge::zero_gauge(&self.geom, couplings.view());
        let couplings = gauge::fieldless_even(&self.geom, fields.view(), centered.view());

        if self.cfg.resetseqs {
            for device in &self.devices {
                device.fill_seqs(startseq)?;
            }
        }
        for device in &self.devices {
            device.set_couplings(Role::Main, couplings.clone())?;
        }

        let set = {
            let Self {
                driver,
                devices,
                writer,
                rng,
                ..
            } = self;
            driver.sample(devices.as_slice(), rng, |tick, bimarg| {
                writer
                    .as_ref()
                    .map_or(Ok(()), |w| w.write_tracked(name, tick, bimarg.view()))
            })?
        };

        let stats = observables::fit_stats(self.bimarg_target.view(), set.bimarg.view());
        info!(
            name,
            ferr = stats.ferr,
            ssr = stats.ssr,
            wdf = stats.wdf,
            swap_rate = set.swap_rate,
            "sampling statistics"
        );

        if let Some(writer) = &self.writer {
            writer.write_macro(
                name,
                &MacroRecord {
                    startseq,
                    alphabet: &self.alphabet,
                    stats,
                    couplings: couplings.view(),
                    bimarg: set.bimarg.view(),
                    bicount: set.bicount.view(),
                    energies: set.energies.view(),
                    seqs: &set.seqs,
                    swap_rate: self
                        .driver
                        .config()
                        .tempering
                        .is_some()
                        .then_some(set.swap_rate),
                },
            )?;
        }

        let outcome = newton::refine(
            &self.devices,
            self.bimarg_target.view(),
            &set.bimarg,
            &self.cfg.newton,
        )?;
        if let Some(writer) = &self.writer {
            writer.write_predicted(name, outcome.bimarg.view())?;
        }

        // uniformly random seed sequence from the sampled population
        let total: usize = set.seqs.iter().map(ndarray::Array2::nrows).sum();
        let mut index = self.rng.gen_range(0..total);
        let mut next = None;
        for seqs in &set.seqs {
            if index < seqs.nrows() {
                next = Some(seqs.row(index).to_vec());
                break;
            }
            index -= seqs.nrows();
        }
        let next = next.unwrap_or_else(|| unreachable!());

        Ok((next, outcome.couplings))
    }
}

/// Couplings carrying the independent log-odds of the target's single-site
/// marginals, distributed into the fieldless-even gauge.
#[must_use]
pub fn logscore_couplings(geom: &Geometry, bimarg_target: ArrayView2<f32>) -> Array2<f32> {
    let marg = observables::single_site_marginals(geom, bimarg_target);
    let mut fields = marg.mapv(|p| -p.max(f32::MIN_POSITIVE).ln());

    let q = geom.num_letters();
    for mut row in fields.rows_mut() {
        #[allow(clippy::cast_precision_loss)]
        let mean = row.iter().sum::<f32>() / q as f32;
        row.mapv_inplace(|h| h - mean);
    }

    let zero = Array2::zeros((geom.num_pairs(), geom.num_states()));
    gauge::fieldless_even(geom, fields.view(), zero.view())
}

#[cfg(test)]
mod tests {
    use super::logscore_couplings;
    use crate::gauge;
    use crate::geometry::Geometry;
    use crate::observables;
    use float_cmp::assert_approx_eq;
    use ndarray::Array2;

    #[test]
    fn logscore_couplings_reproduce_site_energies() {
        let geom = Geometry::new(4, 2);
        // independent sites, p = (0.25, 0.75)
        let block = [0.0625_f32, 0.1875, 0.1875, 0.5625];
        let target = Array2::from_shape_fn((geom.num_pairs(), 4), |(_, s)| block[s]);

        let couplings = logscore_couplings(&geom, target.view());
        let marg = observables::single_site_marginals(&geom, target.view());

        // the energy difference between two sequences differing at one site
        // matches the log-odds of that site
        let e0 = gauge::pair_energy(&geom, couplings.view(), &[0, 0, 0, 0]);
        let e1 = gauge::pair_energy(&geom, couplings.view(), &[1, 0, 0, 0]);
        let expected = -(marg[[0, 1]].ln()) - (-(marg[[0, 0]].ln()));
        assert_approx_eq!(f32, e1 - e0, expected, epsilon = 1e-4);
    }
}
