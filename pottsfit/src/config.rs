//! The configuration surface the engine consumes.
//!
//! Everything here is validated up front; a bad value is a configuration
//! fault that aborts before any device work is enqueued.

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::kernels::WALKER_GROUP;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Shrinkage regularization of the coupling update.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Regularization {
    /// Strength of the shrinkage term.
    pub fn_lmbda: f32,
    /// Coupling scale beyond which shrinkage is damped away.
    pub fn_s: f32,
}

/// Step acceptance policy of the Newton refiner.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum NewtonPolicy {
    /// Accept only steps that do not increase the SSR; rejected steps halve
    /// gamma and retry. The reproducible default.
    #[default]
    Monotone,
    /// Accept every step unconditionally.
    Always,
}

/// Parameters of the Newton refinement phase.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct NewtonConfig {
    /// Initial learning rate `gamma`.
    pub gamma0: f32,
    /// Number of refinement iterations per phase.
    pub newton_steps: u32,
    /// Pseudocount damping `pc` of the update denominator.
    pub pcdamping: f32,
    /// Optional shrinkage regularization.
    pub regularization: Option<Regularization>,
    /// Step acceptance policy.
    pub policy: NewtonPolicy,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            gamma0: 4e-4,
            newton_steps: 32,
            pcdamping: 1e-3,
            regularization: None,
            policy: NewtonPolicy::default(),
        }
    }
}

/// Parameters of one MCMC sampling phase.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct McmcConfig {
    /// Equilibration passes before sampling starts.
    pub equiltime: usize,
    /// Passes between successive post-equilibration snapshots.
    pub sampletime: usize,
    /// Snapshots accumulated into the large buffer.
    pub nsamples: usize,
    /// Metropolis proposals per walker per pass, in multiples of `L`.
    pub nsteps: usize,
    /// Reduce and checkpoint marginals every this many equilibration
    /// passes; `0` disables tracking.
    pub trackequil: usize,
    /// Optional inverse-temperature ladder; the first entry is the primary
    /// ensemble whose walkers contribute to statistics.
    pub tempering: Option<Vec<f32>>,
    /// Temperature-swap proposals after each pass when tempering.
    pub nswaps: usize,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            equiltime: 128,
            sampletime: 8,
            nsamples: 4,
            nsteps: 1,
            trackequil: 0,
            tempering: None,
            nswaps: 0,
        }
    }
}

/// The full configuration of an inference run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RunConfig {
    /// Sampling-phase parameters.
    pub mcmc: McmcConfig,
    /// Refinement-phase parameters.
    pub newton: NewtonConfig,
    /// Total walker count across all devices.
    pub nwalkers: usize,
    /// Number of devices the walkers are partitioned over.
    pub ndevices: usize,
    /// Master seed; device and host PRNGs all derive from it.
    pub seed: u64,
    /// Macro-iterations of the sample-then-refine loop.
    pub mcmcsteps: usize,
    /// Reset all walkers to the start sequence at the head of each
    /// macro-iteration.
    pub resetseqs: bool,
    /// Run a one-shot Newton refinement over an initial population before
    /// the main loop.
    pub preopt: bool,
    /// Alternative to `preopt`: plain MCMC passes before the main loop.
    pub preequiltime: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mcmc: McmcConfig::default(),
            newton: NewtonConfig::default(),
            nwalkers: 4096,
            ndevices: 1,
            seed: 1234,
            mcmcsteps: 5,
            resetseqs: true,
            preopt: false,
            preequiltime: 0,
        }
    }
}

impl RunConfig {
    /// Walkers per device.
    #[must_use]
    pub const fn walkers_per_device(&self) -> usize {
        self.nwalkers / self.ndevices
    }

    /// Sample-set capacity per device.
    #[must_use]
    pub const fn samples_per_device(&self) -> usize {
        self.mcmc.nsamples * self.walkers_per_device()
    }

    /// Checks the whole configuration against a geometry and the target
    /// marginals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first fault found.
    pub fn validate(&self, geom: &Geometry, bimarg_target: ArrayView2<f32>) -> Result<()> {
        let expected = (geom.num_pairs(), geom.num_states());
        if bimarg_target.dim() != expected {
            return Err(Error::Config(format!(
                "target bimarg has shape {:?}, geometry needs {expected:?}",
                bimarg_target.dim()
            )));
        }
        if bimarg_target.iter().any(|&x| !(0.0..=1.0).contains(&x)) {
            return Err(Error::Config(
                "target bimarg entries must lie in [0, 1]".to_owned(),
            ));
        }

        if self.ndevices == 0 {
            return Err(Error::Config("at least one device is required".to_owned()));
        }
        if self.nwalkers == 0 || self.nwalkers % (self.ndevices * WALKER_GROUP) != 0 {
            return Err(Error::Config(format!(
                "nwalkers ({}) must be a positive multiple of ndevices * {WALKER_GROUP}",
                self.nwalkers
            )));
        }
        if self.mcmc.nsamples == 0 {
            return Err(Error::Config("nsamples must be at least 1".to_owned()));
        }
        if self.mcmc.nsteps == 0 {
            return Err(Error::Config("nsteps must be at least 1".to_owned()));
        }
        if self.mcmc.trackequil != 0 && self.mcmc.equiltime % self.mcmc.trackequil != 0 {
            return Err(Error::Config(
                "trackequil must be a divisor of equiltime".to_owned(),
            ));
        }

        if let Some(ladder) = &self.mcmc.tempering {
            if ladder.is_empty() {
                return Err(Error::Config("tempering ladder is empty".to_owned()));
            }
            if ladder.iter().any(|&b| !b.is_finite() || b <= 0.0) {
                return Err(Error::Config(
                    "tempering ladder entries must be positive and finite".to_owned(),
                ));
            }
            if self.nwalkers % ladder.len() != 0 {
                return Err(Error::Config(format!(
                    "number of temperatures ({}) must evenly divide nwalkers ({})",
                    ladder.len(),
                    self.nwalkers
                )));
            }
            if self.mcmc.nswaps == 0 {
                return Err(Error::Config(
                    "tempering requires nswaps > 0".to_owned(),
                ));
            }
        }

        if !self.newton.gamma0.is_finite() || self.newton.gamma0 <= 0.0 {
            return Err(Error::Config("gamma0 must be positive".to_owned()));
        }
        if self.newton.newton_steps == 0 {
            return Err(Error::Config("newtonSteps must be at least 1".to_owned()));
        }
        if !self.newton.pcdamping.is_finite() || self.newton.pcdamping < 0.0 {
            return Err(Error::Config(
                "pc-damping must be non-negative".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RunConfig;
    use crate::geometry::Geometry;
    use ndarray::Array2;

    fn uniform_target(geom: &Geometry) -> Array2<f32> {
        #[allow(clippy::cast_precision_loss)]
        Array2::from_elem(
            (geom.num_pairs(), geom.num_states()),
            1.0 / geom.num_states() as f32,
        )
    }

    #[test]
    fn default_config_validates() {
        let geom = Geometry::new(8, 4);
        let cfg = RunConfig::default();
        cfg.validate(&geom, uniform_target(&geom).view()).unwrap();
    }

    #[test]
    fn rejects_walker_count_not_divisible_by_group() {
        let geom = Geometry::new(8, 4);
        let cfg = RunConfig {
            nwalkers: 100,
            ..RunConfig::default()
        };
        assert!(cfg.validate(&geom, uniform_target(&geom).view()).is_err());
    }

    #[test]
    fn rejects_out_of_range_target() {
        let geom = Geometry::new(8, 4);
        let mut target = uniform_target(&geom);
        target[[0, 0]] = 1.5;
        let cfg = RunConfig::default();
        assert!(cfg.validate(&geom, target.view()).is_err());
    }

    #[test]
    fn rejects_ladder_not_dividing_walkers() {
        let geom = Geometry::new(8, 4);
        let cfg = RunConfig {
            mcmc: crate::config::McmcConfig {
                tempering: Some(vec![1.0, 0.5, 0.25]),
                nswaps: 64,
                ..crate::config::McmcConfig::default()
            },
            ..RunConfig::default()
        };
        assert!(cfg.validate(&geom, uniform_target(&geom).view()).is_err());
    }
}
