//! MCMC throughput benchmarking and floating-point drift measurement.

use crate::buffers::{Role, SeqBuf};
use crate::device::Device;
use crate::error::Result;
use ndarray::Array2;
use std::time::{Duration, Instant};
use tracing::info;

/// Timing of a benchmark run.
#[derive(Clone, Copy, Debug)]
pub struct BenchReport {
    /// Wall time of the timed passes.
    pub elapsed: Duration,
    /// Wall time per outer pass.
    pub per_pass: Duration,
    /// Single-site Metropolis proposals per second across all devices.
    pub steps_per_second: f64,
}

/// Runs `passes` warmup passes followed by `passes` timed passes of the
/// Metropolis kernel and reports throughput.
///
/// # Errors
///
/// Propagates device faults.
pub fn benchmark(
    devices: &[Device],
    couplings: &Array2<f32>,
    startseq: &[u8],
    passes: usize,
    nsteps: usize,
) -> Result<BenchReport> {
    for device in devices {
        device.fill_seqs(startseq)?;
        device.set_couplings(Role::Main, couplings.clone())?;
    }

    let mut launch = 0_u64;
    let mut run_pass = |devices: &[Device], launch: &mut u64| -> Result<()> {
        for device in devices {
            *launch += 1;
            device.run_mcmc(*launch, nsteps)?;
        }
        Ok(())
    };

    info!(passes, "benchmark warmup");
    for device in devices {
        device.calc_energies(SeqBuf::Small, Role::Main)?;
    }
    for _ in 0..passes {
        run_pass(devices, &mut launch)?;
    }
    for device in devices {
        device.wait()?;
    }

    info!(passes, "benchmark timed run");
    let start = Instant::now();
    for _ in 0..passes {
        run_pass(devices, &mut launch)?;
    }
    for device in devices {
        device.wait()?;
    }
    let elapsed = start.elapsed();

    let walkers: usize = devices.iter().map(Device::num_walkers).sum();
    let seq_len = devices[0].geometry().seq_len();
    #[allow(clippy::cast_precision_loss)]
    let total_steps = (walkers * passes * nsteps * seq_len) as f64;

    Ok(BenchReport {
        elapsed,
        per_pass: elapsed / u32::try_from(passes.max(1)).unwrap_or(u32::MAX),
        steps_per_second: total_steps / elapsed.as_secs_f64().max(f64::EPSILON),
    })
}

/// Measures the floating-point drift between kernel-tracked energies and
/// from-scratch recomputation: the mean squared difference per round.
///
/// # Errors
///
/// Propagates device faults.
pub fn measure_fp_error(device: &Device, rounds: usize, nsteps: usize) -> Result<Vec<f32>> {
    let mut errors = Vec::with_capacity(rounds);

    for round in 0..rounds {
        device.run_mcmc(0xf9e1 + round as u64, nsteps)?;
        let tracked = device.energies(SeqBuf::Small).wait()?;
        device.calc_energies(SeqBuf::Small, Role::Main)?;
        let recomputed = device.energies(SeqBuf::Small).wait()?;

        let mse: f64 = tracked
            .iter()
            .zip(&recomputed)
            .map(|(&a, &b)| {
                let d = f64::from(a) - f64::from(b);
                d * d
            })
            .sum::<f64>()
            / tracked.len().max(1) as f64;
        #[allow(clippy::cast_possible_truncation)]
        errors.push(mse as f32);

        info!(round, mse, "energy drift");
    }

    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::{benchmark, measure_fp_error};
    use crate::device::Device;
    use crate::geometry::Geometry;
    use ndarray::Array2;

    #[test]
    fn benchmark_counts_all_proposals() {
        let geom = Geometry::new(6, 3);
        let devices = vec![Device::new(0, 5, geom, 64, 64).unwrap()];
        let couplings = Array2::zeros((geom.num_pairs(), geom.num_states()));

        let report = benchmark(&devices, &couplings, &[0, 1, 2, 0, 1, 2], 2, 1).unwrap();
        assert!(report.steps_per_second > 0.0);
        assert!(report.elapsed >= report.per_pass);
    }

    #[test]
    fn drift_is_tiny_for_small_systems() {
        let geom = Geometry::new(8, 4);
        let device = Device::new(0, 5, geom, 64, 64).unwrap();
        device.fill_seqs(&[0; 8]).unwrap();
        let couplings =
            Array2::from_shape_fn((geom.num_pairs(), geom.num_states()), |(n, s)| {
                ((n + s) % 7) as f32 * 0.1 - 0.3
            });
        device
            .set_couplings(crate::buffers::Role::Main, couplings)
            .unwrap();

        let errors = measure_fp_error(&device, 3, 2).unwrap();
        assert_eq!(errors.len(), 3);
        for e in errors {
            assert!(e < 1e-6, "drift too large: {e}");
        }
    }
}
