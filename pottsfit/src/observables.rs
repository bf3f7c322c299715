//! Host-side reductions over per-device results and the summary statistics
//! reported for each macro-iteration.
//!
//! Device-visible tensors are `f32`; the reductions here promote to `f64`
//! where summands can span orders of magnitude, and store final marginals
//! back as `f32`.

use crate::geometry::Geometry;
use ndarray::{Array2, ArrayView2};
use std::ops::AddAssign;

/// Element-wise sum of per-device tensors.
///
/// # Panics
///
/// Panics when called with no arrays or with mismatched shapes.
#[must_use]
pub fn sum_arrays<T>(mut arrays: Vec<Array2<T>>) -> Array2<T>
where
    T: Copy + AddAssign,
{
    let mut total = arrays.swap_remove(0);
    for array in arrays {
        total.zip_mut_with(&array, |t, &x| *t += x);
    }
    total
}

/// Element-wise mean of per-device tensors.
///
/// # Panics
///
/// Panics when called with no arrays or with mismatched shapes.
#[must_use]
pub fn mean_arrays(arrays: Vec<Array2<f32>>) -> Array2<f32> {
    #[allow(clippy::cast_precision_loss)]
    let count = arrays.len() as f32;
    let mut total = sum_arrays(arrays);
    total.mapv_inplace(|x| x / count);
    total
}

/// Normalizes a pooled pair histogram into marginals; every row of the
/// result sums to one.
#[must_use]
pub fn normalize_bicounts(bicount: ArrayView2<u32>) -> Array2<f32> {
    let mut bimarg = Array2::<f32>::zeros(bicount.dim());

    for (mut out, row) in bimarg.rows_mut().into_iter().zip(bicount.rows()) {
        let total: f64 = row.iter().map(|&c| f64::from(c)).sum();
        if total > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            out.iter_mut()
                .zip(row)
                .for_each(|(o, &c)| *o = (f64::from(c) / total) as f32);
        }
    }

    bimarg
}

/// Pools per-device marginal estimates weighted by their effective sample
/// counts: `B = sum(neff_d * B_d) / sum(neff_d)`.
///
/// Returns the total `Neff` and the pooled marginals.
///
/// # Panics
///
/// Panics when called with no parts or with mismatched shapes.
#[must_use]
pub fn pool_weighted_bimarg(parts: &[(f32, Array2<f32>)]) -> (f64, Array2<f32>) {
    let neff_total: f64 = parts.iter().map(|(neff, _)| f64::from(*neff)).sum();
    let mut pooled = Array2::<f64>::zeros(parts[0].1.dim());

    for (neff, bimarg) in parts {
        let weight = f64::from(*neff);
        pooled.zip_mut_with(bimarg, |p, &b| *p += weight * f64::from(b));
    }

    #[allow(clippy::cast_possible_truncation)]
    let pooled = pooled.mapv(|x| if neff_total > 0.0 { (x / neff_total) as f32 } else { 0.0 });
    (neff_total, pooled)
}

/// Sum of squared residuals between model and target marginals.
#[must_use]
pub fn ssr(target: ArrayView2<f32>, model: ArrayView2<f32>) -> f32 {
    let total: f64 = target
        .iter()
        .zip(model)
        .map(|(&t, &m)| {
            let d = f64::from(t) - f64::from(m);
            d * d
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    {
        total as f32
    }
}

/// Threshold above which a target bin enters the fractional error.
pub const FERR_CUTOFF: f32 = 0.01;

/// Summary statistics of a model-marginal estimate versus the target.
#[derive(Clone, Copy, Debug)]
pub struct FitStats {
    /// Mean fractional error over bins whose target exceeds
    /// [`FERR_CUTOFF`].
    pub ferr: f32,
    /// Sum of squared residuals over all bins.
    pub ssr: f32,
    /// Target-weighted absolute deviation, `sum(B_target * |dB|)`.
    pub wdf: f32,
}

/// Computes [`FitStats`] for a model estimate.
#[must_use]
pub fn fit_stats(target: ArrayView2<f32>, model: ArrayView2<f32>) -> FitStats {
    let mut frac_sum = 0.0_f64;
    let mut frac_count = 0_usize;
    let mut wdf = 0.0_f64;

    for (&t, &m) in target.iter().zip(model) {
        let diff = f64::from(t) - f64::from(m);
        if t > FERR_CUTOFF {
            frac_sum += diff.abs() / f64::from(t);
            frac_count += 1;
        }
        wdf += f64::from(t) * diff.abs();
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    FitStats {
        ferr: if frac_count == 0 {
            0.0
        } else {
            (frac_sum / frac_count as f64) as f32
        },
        ssr: ssr(target, model),
        wdf: wdf as f32,
    }
}

/// Extracts single-site marginals from a pairwise tensor: site `0` comes
/// from the row sums of pair `(0, 1)`, site `j > 0` from the column sums of
/// pair `(0, j)`. Rows are renormalized to absorb rounding.
///
/// # Panics
///
/// Panics if `bimarg` does not match the geometry.
#[must_use]
pub fn single_site_marginals(geom: &Geometry, bimarg: ArrayView2<f32>) -> Array2<f32> {
    assert_eq!(
        bimarg.dim(),
        (geom.num_pairs(), geom.num_states()),
        "bimarg tensor shape mismatch"
    );

    let q = geom.num_letters();
    let mut marg = Array2::<f64>::zeros((geom.seq_len(), q));

    for a in 0..q {
        for b in 0..q {
            marg[[0, a]] += f64::from(bimarg[[0, a * q + b]]);
        }
    }
    for j in 1..geom.seq_len() {
        let n = geom.pair_index(0, j);
        for a in 0..q {
            for b in 0..q {
                marg[[j, b]] += f64::from(bimarg[[n, a * q + b]]);
            }
        }
    }

    for mut row in marg.rows_mut() {
        let total: f64 = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|x| x / total);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    marg.mapv(|x| x as f32)
}

#[cfg(test)]
mod tests {
    use super::{
        fit_stats, normalize_bicounts, pool_weighted_bimarg, single_site_marginals, sum_arrays,
    };
    use crate::geometry::Geometry;
    use float_cmp::assert_approx_eq;
    use ndarray::{array, Array2};

    #[test]
    fn sum_and_normalize() {
        let parts = vec![array![[1_u32, 3], [0, 4]], array![[1_u32, 3], [4, 0]]];
        let total = sum_arrays(parts);
        assert_eq!(total, array![[2, 6], [4, 4]]);

        let bimarg = normalize_bicounts(total.view());
        assert_approx_eq!(f32, bimarg[[0, 0]], 0.25);
        assert_approx_eq!(f32, bimarg[[0, 1]], 0.75);
        for row in bimarg.rows() {
            assert_approx_eq!(f32, row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn pooling_weights_by_neff() {
        let parts = vec![
            (3.0_f32, array![[1.0_f32, 0.0]]),
            (1.0_f32, array![[0.0_f32, 1.0]]),
        ];
        let (neff, pooled) = pool_weighted_bimarg(&parts);
        assert_approx_eq!(f64, neff, 4.0);
        assert_approx_eq!(f32, pooled[[0, 0]], 0.75);
        assert_approx_eq!(f32, pooled[[0, 1]], 0.25);
    }

    #[test]
    fn stats_ignore_rare_bins_in_ferr() {
        let target = array![[0.5_f32, 0.001, 0.499, 0.0]];
        let model = array![[0.4_f32, 0.101, 0.499, 0.0]];

        let stats = fit_stats(target.view(), model.view());
        // only the two bins above the cutoff enter ferr
        assert_approx_eq!(f32, stats.ferr, 0.5 * (0.1 / 0.5), epsilon = 1e-6);
        assert_approx_eq!(f32, stats.ssr, 0.1 * 0.1 + 0.1 * 0.1, epsilon = 1e-6);
    }

    #[test]
    fn site_marginals_recover_factorized_target() {
        let geom = Geometry::new(3, 2);
        // independent sites with p = (0.25, 0.75) everywhere
        let block = [0.0625_f32, 0.1875, 0.1875, 0.5625];
        let bimarg = Array2::from_shape_fn((3, 4), |(_, s)| block[s]);

        let marg = single_site_marginals(&geom, bimarg.view());
        for i in 0..3 {
            assert_approx_eq!(f32, marg[[i, 0]], 0.25, epsilon = 1e-6);
            assert_approx_eq!(f32, marg[[i, 1]], 0.75, epsilon = 1e-6);
        }
    }
}
