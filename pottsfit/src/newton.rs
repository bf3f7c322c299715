//! The Newton refiner.
//!
//! Instead of re-sampling for every proposed coupling update, the refiner
//! importance-reweights the already-equilibrated sample set: a trial `J'`
//! is written to the front buffer, the pair is swapped so the trial sits in
//! `back` for the reweighting kernels, and the resulting marginal estimate
//! is pooled across devices weighted by each device's effective sample
//! count. The back buffers always hold the last accepted `(J, B)` pair.

use crate::buffers::{Role, SeqBuf};
use crate::config::{NewtonConfig, NewtonPolicy};
use crate::device::{wait_all, Device, Field};
use crate::error::{Error, Result};
use crate::observables;
use ndarray::{Array2, ArrayView2};
use tracing::{debug, info};

/// Consecutive rejections after which the refinement phase gives up.
const GAMMA_STEPS: u32 = 16;

/// Factor below the initial `gamma` at which the trust region is exhausted.
const GAMMA_FLOOR: f32 = 64.0;

/// Result of one refinement phase: the last accepted state and the SSR
/// trace of the accepted steps.
#[derive(Debug)]
pub struct NewtonOutcome {
    /// Last accepted couplings.
    pub couplings: Array2<f32>,
    /// Marginals predicted for the accepted couplings by reweighting.
    pub bimarg: Array2<f32>,
    /// SSR after every accepted step; non-increasing under
    /// [`NewtonPolicy::Monotone`].
    pub ssr_trace: Vec<f32>,
    /// Learning rate when the phase ended.
    pub final_gamma: f32,
}

struct TrialResult {
    ssr: f32,
    neff: f64,
    bimarg: Array2<f32>,
    weight_span: (f32, f32),
}

/// One trial step: propose `J'`, estimate its marginals by reweighting the
/// sample set, and pool across devices.
fn trial_step(
    devices: &[Device],
    bimarg_target: ArrayView2<f32>,
    gamma: f32,
    cfg: &NewtonConfig,
) -> Result<TrialResult> {
    for device in devices {
        // the update is deterministic, so every device computes the same J'
        device.update_couplings(gamma, cfg.pcdamping, cfg.regularization)?;
    }
    for device in devices {
        device.swap(Field::Couplings)?;
        device.perturb_marg()?;
        device.swap(Field::Couplings)?;
    }
    // front holds the trial parameters, back the last accepted ones

    let bimargs = wait_all(devices.iter().map(|d| d.bimarg(Role::Front)).collect())?;
    let neffs = wait_all(devices.iter().map(Device::neff).collect())?;
    let weights = wait_all(devices.iter().map(Device::weights).collect())?;

    let parts: Vec<(f32, Array2<f32>)> = neffs.into_iter().zip(bimargs).collect();
    let (neff, bimarg) = observables::pool_weighted_bimarg(&parts);
    let ssr = observables::ssr(bimarg_target, bimarg.view());

    let mut span = (f32::INFINITY, f32::NEG_INFINITY);
    for w in weights.iter().flatten() {
        span = (span.0.min(*w), span.1.max(*w));
    }

    Ok(TrialResult {
        ssr,
        neff,
        bimarg,
        weight_span: span,
    })
}

/// Runs one refinement phase over the current large sample set.
///
/// `bimarg_model` is the direct marginal estimate of that sample set; it
/// seeds the last-accepted marginals. On return the back buffers of every
/// device hold the final accepted state, which is also handed back.
///
/// # Errors
///
/// Returns [`Error::Divergence`] when the effective sample count collapses
/// to zero or turns non-finite; device faults are propagated.
pub fn refine(
    devices: &[Device],
    bimarg_target: ArrayView2<f32>,
    bimarg_model: &Array2<f32>,
    cfg: &NewtonConfig,
) -> Result<NewtonOutcome> {
    // back buffers hold the last accepted values, front is trial scratch;
    // reference energies for the reweighting are cached under the current
    // main couplings
    for device in devices {
        device.calc_energies(SeqBuf::Large, Role::Main)?;
        device.copy(Field::Couplings, Role::Main, Role::Back)?;
        device.copy(Field::Couplings, Role::Main, Role::Front)?;
        device.set_bimarg(Role::Main, bimarg_model.clone())?;
        device.copy(Field::Bimarg, Role::Main, Role::Back)?;
    }

    let mut gamma = cfg.gamma0;
    let mut last_ssr = f32::INFINITY;
    let mut rejects = 0_u32;
    let mut trace = Vec::new();

    for step in 0..cfg.newton_steps {
        let trial = trial_step(devices, bimarg_target, gamma, cfg)?;

        if !trial.neff.is_finite() || trial.neff == 0.0 {
            return Err(Error::Divergence(format!(
                "Neff = {} at step {step}; decrease gamma or increase pc-damping",
                trial.neff
            )));
        }

        debug!(
            step,
            ssr = trial.ssr,
            neff = trial.neff,
            w_min = trial.weight_span.0,
            w_max = trial.weight_span.1,
            "newton trial"
        );

        if cfg.policy == NewtonPolicy::Always || trial.ssr <= last_ssr {
            for device in devices {
                device.store(Field::Couplings)?;
                device.set_bimarg(Role::Front, trial.bimarg.clone())?;
                device.store(Field::Bimarg)?;
            }
            last_ssr = trial.ssr;
            trace.push(trial.ssr);
            rejects = 0;
        } else {
            gamma /= 2.0;
            rejects += 1;
            info!(gamma, ssr = trial.ssr, "step rejected, halving gamma");
            if gamma < cfg.gamma0 / GAMMA_FLOOR {
                info!("gamma decreased too far below gamma0, stopping refinement");
                break;
            }
            if rejects >= GAMMA_STEPS {
                info!("too many consecutive SSR increases, stopping refinement");
                break;
            }
        }
    }

    let couplings = devices[0].couplings(Role::Back).wait()?;
    let bimarg = devices[0].bimarg(Role::Back).wait()?;

    info!(
        accepted = trace.len(),
        final_ssr = trace.last().copied().unwrap_or(f32::NAN),
        "refinement phase done"
    );

    Ok(NewtonOutcome {
        couplings,
        bimarg,
        ssr_trace: trace,
        final_gamma: gamma,
    })
}

#[cfg(test)]
mod tests {
    use super::refine;
    use crate::buffers::{Role, SeqBuf};
    use crate::config::{NewtonConfig, NewtonPolicy};
    use crate::device::Device;
    use crate::error::Error;
    use crate::geometry::Geometry;
    use ndarray::Array2;

    fn uniform(geom: &Geometry) -> Array2<f32> {
        #[allow(clippy::cast_precision_loss)]
        Array2::from_elem(
            (geom.num_pairs(), geom.num_states()),
            1.0 / geom.num_states() as f32,
        )
    }

    /// A device with a sampled population: uniform random sequences under
    /// zero couplings.
    fn sampled_device(geom: Geometry) -> Device {
        let device = Device::new(0, 9, geom, 64, 256).unwrap();
        device.fill_seqs(&vec![0; geom.seq_len()]).unwrap();
        device.run_mcmc(1, 2).unwrap();
        for _ in 0..4 {
            device.run_mcmc(2, 2).unwrap();
            device.store_seqs().unwrap();
        }
        device.calc_bicounts(SeqBuf::Large, false).unwrap();
        device
    }

    #[test]
    fn monotone_refinement_produces_non_increasing_ssr() {
        let geom = Geometry::new(6, 3);
        let device = sampled_device(geom);
        let target = uniform(&geom);
        device.set_bimarg_target(target.clone()).unwrap();
        let model = device.bimarg(Role::Main).wait().unwrap();

        let cfg = NewtonConfig {
            gamma0: 1e-2,
            newton_steps: 16,
            ..NewtonConfig::default()
        };
        let outcome = refine(&[device], target.view(), &model, &cfg).unwrap();

        assert!(!outcome.ssr_trace.is_empty());
        for pair in outcome.ssr_trace.windows(2) {
            assert!(pair[1] <= pair[0], "SSR increased: {pair:?}");
        }
    }

    #[test]
    fn accepted_steps_leave_front_equal_to_back() {
        let geom = Geometry::new(6, 3);
        let device = sampled_device(geom);
        let target = uniform(&geom);
        device.set_bimarg_target(target.clone()).unwrap();
        let model = device.bimarg(Role::Main).wait().unwrap();

        let cfg = NewtonConfig {
            gamma0: 1e-3,
            newton_steps: 4,
            policy: NewtonPolicy::Always,
            ..NewtonConfig::default()
        };
        let devices = [device];
        refine(&devices, target.view(), &model, &cfg).unwrap();

        let front = devices[0].couplings(Role::Front).wait().unwrap();
        let back = devices[0].couplings(Role::Back).wait().unwrap();
        assert_eq!(front, back);
        let bi_front = devices[0].bimarg(Role::Front).wait().unwrap();
        let bi_back = devices[0].bimarg(Role::Back).wait().unwrap();
        assert_eq!(bi_front, bi_back);
    }

    #[test]
    fn runaway_gamma_is_reported_as_divergence() {
        let geom = Geometry::new(6, 3);
        let device = sampled_device(geom);
        let target = uniform(&geom);
        device.set_bimarg_target(target.clone()).unwrap();
        let model = device.bimarg(Role::Main).wait().unwrap();

        let cfg = NewtonConfig {
            gamma0: 1e4,
            pcdamping: 1e-8,
            newton_steps: 4,
            ..NewtonConfig::default()
        };
        let result = refine(&[device], target.view(), &model, &cfg);
        assert!(matches!(result, Err(Error::Divergence(_))));
    }
}
