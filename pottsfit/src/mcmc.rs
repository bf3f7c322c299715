//! The MCMC driver: outer sweeping over all devices, optional parallel
//! tempering, equilibration tracking and post-equilibration sampling.
//!
//! Devices are launched in sequence inside each outer pass so that no
//! single command queue is flooded; across passes they only synchronize
//! through host-orchestrated work (temperature swaps, tracking barriers).

use crate::buffers::{Role, SeqBuf};
use crate::config::McmcConfig;
use crate::device::{wait_all, Device};
use crate::error::Result;
use crate::observables;
use ndarray::{concatenate, Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_pcg::Pcg64;
use tracing::{debug, info};

/// Everything one sampling phase produces: the pooled statistics of the
/// large sample set and the observed tempering swap rate.
#[derive(Debug)]
pub struct SampleSet {
    /// Pooled pairwise marginals of the sample set.
    pub bimarg: Array2<f32>,
    /// Pooled pair histogram.
    pub bicount: Array2<u32>,
    /// Energies of all sampled sequences, concatenated across devices.
    pub energies: Array1<f32>,
    /// Sampled sequences, one array per device.
    pub seqs: Vec<Array2<u8>>,
    /// Accepted fraction of temperature-swap proposals, `0` without
    /// tempering.
    pub swap_rate: f32,
}

/// Drives the Metropolis kernel across a device pool.
#[derive(Debug)]
pub struct McmcDriver {
    cfg: McmcConfig,
    /// Distinct run seed per kernel launch; never reused within a run.
    launches: u64,
}

impl McmcDriver {
    /// Creates a driver for the given sampling parameters.
    #[must_use]
    pub const fn new(cfg: McmcConfig) -> Self {
        Self { cfg, launches: 0 }
    }

    /// The sampling parameters this driver runs with.
    #[must_use]
    pub const fn config(&self) -> &McmcConfig {
        &self.cfg
    }

    fn primary_beta(&self) -> f32 {
        self.cfg
            .tempering
            .as_ref()
            .map_or(1.0, |ladder| ladder[0])
    }

    fn next_run_seed(&mut self) -> u64 {
        self.launches += 1;
        self.launches
    }

    /// One outer pass: every device advances all its walkers once.
    fn pass(&mut self, devices: &[Device]) -> Result<()> {
        let nsteps = self.cfg.nsteps;
        for device in devices {
            let run_seed = self.next_run_seed();
            device.run_mcmc(run_seed, nsteps)?;
        }
        Ok(())
    }

    /// Assigns inverse temperatures to all walkers by equal partition
    /// across the ladder, shuffled, and marks the primary ensemble.
    ///
    /// # Errors
    ///
    /// Propagates device faults.
    pub fn init_tempering(&self, devices: &[Device], rng: &mut Pcg64) -> Result<()> {
        let Some(ladder) = &self.cfg.tempering else {
            return Ok(());
        };

        let total: usize = devices.iter().map(Device::num_walkers).sum();
        let share = total / ladder.len();
        let mut betas: Vec<f32> = ladder
            .iter()
            .flat_map(|&beta| std::iter::repeat(beta).take(share))
            .collect();
        betas.shuffle(rng);

        let b0 = ladder[0];
        let mut offset = 0;
        for device in devices {
            let count = device.num_walkers();
            let slice = Array1::from(betas[offset..offset + count].to_vec());
            device.set_betas(slice, b0)?;
            offset += count;
        }

        info!(
            ladder = ?ladder,
            per_temperature = share,
            "tempering ladder initialized"
        );
        Ok(())
    }

    /// Proposes `nswaps` Metropolis temperature swaps between randomly
    /// picked walkers of different temperature, then writes the updated
    /// labels back. Returns the accepted fraction.
    ///
    /// # Errors
    ///
    /// Propagates device faults.
    pub fn swap_temps(&self, devices: &[Device], rng: &mut Pcg64) -> Result<f32> {
        let b0 = self.primary_beta();

        for device in devices {
            device.calc_energies(SeqBuf::Small, Role::Main)?;
        }
        let energies = wait_all(
            devices
                .iter()
                .map(|d| d.energies(SeqBuf::Small))
                .collect(),
        )?;
        let betas = wait_all(devices.iter().map(Device::betas).collect())?;

        let energies: Vec<f32> = energies.iter().flatten().copied().collect();
        let mut labels: Vec<f32> = betas.iter().flatten().copied().collect();
        let total = labels.len();

        #[allow(clippy::float_cmp)]
        if labels.iter().all(|&b| b == labels[0]) {
            return Ok(0.0);
        }

        let mut accepted = 0_usize;
        for _ in 0..self.cfg.nswaps {
            let (mut i, mut j) = (0, 0);
            #[allow(clippy::float_cmp)]
            while labels[i] == labels[j] {
                i = rng.gen_range(0..total);
                j = rng.gen_range(0..total);
            }
            let drive = (energies[i] - energies[j]) * (labels[i] - labels[j]);
            if drive > rng.gen_range(0.0..1.0_f32).ln() {
                labels.swap(i, j);
                accepted += 1;
            }
        }

        let mut offset = 0;
        for device in devices {
            let count = device.num_walkers();
            let slice = Array1::from(labels[offset..offset + count].to_vec());
            device.set_betas(slice, b0)?;
            offset += count;
        }

        #[allow(clippy::cast_precision_loss)]
        Ok(accepted as f32 / self.cfg.nswaps.max(1) as f32)
    }

    /// Runs one full sampling phase: `equiltime` equilibration passes,
    /// then `nsamples` snapshots of the primary walkers `sampletime`
    /// passes apart, accumulated into the cleared large buffers; finally
    /// reduces the pooled statistics.
    ///
    /// The main coupling buffers must be up to date on entry. `on_track`
    /// receives the pooled primary-walker marginals at every tracking
    /// barrier.
    ///
    /// # Errors
    ///
    /// Propagates device faults and tracking-sink errors.
    pub fn sample(
        &mut self,
        devices: &[Device],
        rng: &mut Pcg64,
        mut on_track: impl FnMut(usize, &Array2<f32>) -> Result<()>,
    ) -> Result<SampleSet> {
        let mut swap_accum = 0.0_f32;

        for pass_idx in 0..self.cfg.equiltime {
            self.pass(devices)?;
            if self.cfg.tempering.is_some() {
                swap_accum += self.swap_temps(devices, rng)?;
            }

            if self.cfg.trackequil != 0 && (pass_idx + 1) % self.cfg.trackequil == 0 {
                // tracking needs a device-side barrier before reduction
                for device in devices {
                    device.wait()?;
                }
                for device in devices {
                    device.calc_bicounts(SeqBuf::Small, true)?;
                }
                let counts = observables::sum_arrays(wait_all(
                    devices.iter().map(Device::bicount).collect(),
                )?);
                let bimarg = observables::normalize_bicounts(counts.view());
                on_track((pass_idx + 1) / self.cfg.trackequil, &bimarg)?;
                debug!(pass = pass_idx + 1, "equilibration tracked");
            }
        }

        for device in devices {
            device.clear_large()?;
            device.store_seqs()?;
        }
        for _ in 1..self.cfg.nsamples {
            for _ in 0..self.cfg.sampletime {
                self.pass(devices)?;
                if self.cfg.tempering.is_some() {
                    self.swap_temps(devices, rng)?;
                }
            }
            for device in devices {
                device.store_seqs()?;
            }
        }

        for device in devices {
            device.calc_bicounts(SeqBuf::Large, false)?;
            device.calc_energies(SeqBuf::Large, Role::Main)?;
        }
        let bicount = observables::sum_arrays(wait_all(
            devices.iter().map(Device::bicount).collect(),
        )?);
        let energies = wait_all(
            devices
                .iter()
                .map(|d| d.energies(SeqBuf::Large))
                .collect(),
        )?;
        let seqs = wait_all(
            devices
                .iter()
                .map(|d| d.seqs(SeqBuf::Large))
                .collect(),
        )?;

        let bimarg = observables::normalize_bicounts(bicount.view());
        let energies = concatenate(
            Axis(0),
            &energies.iter().map(Array1::view).collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| unreachable!());

        #[allow(clippy::cast_precision_loss)]
        let swap_rate = if self.cfg.tempering.is_some() {
            swap_accum / self.cfg.equiltime.max(1) as f32
        } else {
            0.0
        };

        info!(
            sampled = energies.len(),
            swap_rate,
            "sampling phase complete"
        );

        Ok(SampleSet {
            bimarg,
            bicount,
            energies,
            seqs,
            swap_rate,
        })
    }

    /// Plain equilibration without sampling, for pre-equilibration before
    /// the main loop.
    ///
    /// # Errors
    ///
    /// Propagates device faults.
    pub fn equilibrate_only(
        &mut self,
        devices: &[Device],
        rng: &mut Pcg64,
        passes: usize,
    ) -> Result<()> {
        for _ in 0..passes {
            self.pass(devices)?;
            if self.cfg.tempering.is_some() {
                self.swap_temps(devices, rng)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::McmcDriver;
    use crate::config::McmcConfig;
    use crate::device::Device;
    use crate::geometry::Geometry;
    use float_cmp::assert_approx_eq;
    use ndarray::Array2;
    use rand_pcg::Pcg64;

    fn pool(geom: Geometry, count: usize) -> Vec<Device> {
        (0..count)
            .map(|id| Device::new(id, 1000 + id as u64, geom, 64, 256).unwrap())
            .collect()
    }

    fn test_rng() -> Pcg64 {
        Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
    }

    #[test]
    fn sampling_fills_the_large_buffer() {
        let geom = Geometry::new(6, 3);
        let devices = pool(geom, 2);
        for device in &devices {
            device.fill_seqs(&[0, 1, 2, 0, 1, 2]).unwrap();
        }

        let mut driver = McmcDriver::new(McmcConfig {
            equiltime: 4,
            sampletime: 2,
            nsamples: 4,
            ..McmcConfig::default()
        });
        let set = driver
            .sample(&devices, &mut test_rng(), |_, _| Ok(()))
            .unwrap();

        assert_eq!(set.energies.len(), 2 * 4 * 64);
        assert_eq!(set.seqs.len(), 2);
        assert_eq!(set.seqs[0].nrows(), 4 * 64);
        for row in set.bimarg.rows() {
            assert_approx_eq!(f32, row.sum(), 1.0, epsilon = 1e-5);
        }
        for row in set.bicount.rows() {
            assert_eq!(row.iter().sum::<u32>(), 2 * 4 * 64);
        }
    }

    #[test]
    fn tempering_initialization_partitions_the_ladder() {
        let geom = Geometry::new(6, 3);
        let devices = pool(geom, 2);
        let driver = McmcDriver::new(McmcConfig {
            tempering: Some(vec![1.0, 0.5]),
            nswaps: 16,
            ..McmcConfig::default()
        });

        driver.init_tempering(&devices, &mut test_rng()).unwrap();

        let mut all = Vec::new();
        for device in &devices {
            all.extend(device.betas().wait().unwrap());
        }
        let primaries = all.iter().filter(|&&b| (b - 1.0).abs() < 1e-6).count();
        assert_eq!(primaries, 64);
        assert_eq!(all.len(), 128);
    }

    #[test]
    fn tracking_fires_at_the_right_cadence() {
        let geom = Geometry::new(6, 3);
        let devices = pool(geom, 1);
        for device in &devices {
            device.fill_seqs(&[0, 0, 0, 0, 0, 0]).unwrap();
        }

        let mut driver = McmcDriver::new(McmcConfig {
            equiltime: 8,
            trackequil: 4,
            nsamples: 1,
            ..McmcConfig::default()
        });
        let mut ticks = Vec::new();
        driver
            .sample(&devices, &mut test_rng(), |tick, bimarg| {
                assert_approx_eq!(f32, bimarg.row(0).sum(), 1.0, epsilon = 1e-5);
                ticks.push(tick);
                Ok(())
            })
            .unwrap();

        assert_eq!(ticks, [1, 2]);
    }
}
