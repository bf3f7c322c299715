//! Gauge transforms on coupling tensors.
//!
//! The pairwise parameterization is redundant: many `(h, J)` pairs assign
//! identical energies to every sequence. The transforms here pick canonical
//! representatives. They are pure, total, idempotent up to `f32` rounding,
//! and where stated preserve per-sequence energies exactly (up to rounding).
//!
//! Couplings `J` have shape `(P, q^2)` with the pair ordering of
//! [`Geometry::pairs`]; fields `h` have shape `(L, q)`.

use crate::geometry::Geometry;
use ndarray::{Array2, ArrayView2};

/// Per-block row means, column means and total mean of the `q x q` block of
/// pair `n`, accumulated in `f64`.
fn block_means(geom: &Geometry, block: &[f32]) -> (Vec<f64>, Vec<f64>, f64) {
    let q = geom.num_letters();
    let mut row = vec![0.0; q];
    let mut col = vec![0.0; q];
    let mut all = 0.0;

    for a in 0..q {
        for b in 0..q {
            let v = f64::from(block[a * q + b]);
            row[a] += v;
            col[b] += v;
            all += v;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let qf = q as f64;
    for m in row.iter_mut().chain(&mut col) {
        *m /= qf;
    }

    (row, col, all / (qf * qf))
}

/// Converts couplings to the zero-mean gauge.
///
/// Every `q x q` block of the result has zero row means, zero column means
/// and zero total mean; the removed mass is collected into a field tensor
/// whose rows are themselves centered. Unlike [`zero_j_gauge`] the final
/// field centering discards an energy offset, so per-sequence energies are
/// only preserved up to a sequence-independent constant.
///
/// # Panics
///
/// Panics if `couplings` does not have shape `(P, q^2)`.
#[must_use]
pub fn zero_gauge(geom: &Geometry, couplings: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
    let (fields, centered) = zero_j_gauge(geom, couplings);

    let q = geom.num_letters();
    let mut fields = fields;
    for mut row in fields.rows_mut() {
        #[allow(clippy::cast_precision_loss)]
        let mean = (row.iter().map(|&x| f64::from(x)).sum::<f64>() / q as f64) as f32;
        row.mapv_inplace(|x| x - mean);
    }

    (fields, centered)
}

/// Converts couplings to the zero-J gauge without changing any sequence's
/// total energy: block means move into the field tensor.
///
/// # Panics
///
/// Panics if `couplings` does not have shape `(P, q^2)`.
#[must_use]
pub fn zero_j_gauge(geom: &Geometry, couplings: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
    assert_eq!(
        couplings.dim(),
        (geom.num_pairs(), geom.num_states()),
        "coupling tensor shape mismatch"
    );

    let q = geom.num_letters();
    let mut fields = Array2::<f32>::zeros((geom.seq_len(), q));
    let mut centered = couplings.to_owned();

    for (n, (i, j)) in geom.pairs().enumerate() {
        let block: Vec<f32> = couplings.row(n).to_vec();
        let (row_mean, col_mean, all_mean) = block_means(geom, &block);

        for a in 0..q {
            for b in 0..q {
                #[allow(clippy::cast_possible_truncation)]
                let shift = (row_mean[a] + col_mean[b] - all_mean) as f32;
                centered[[n, a * q + b]] -= shift;
            }
        }

        // the removed mass, evaluated at a sequence's letters, is
        // row_mean[s_i] + col_mean[s_j] - all_mean; split the constant
        // between the two incident positions
        #[allow(clippy::cast_possible_truncation)]
        for x in 0..q {
            fields[[i, x]] += (row_mean[x] - all_mean / 2.0) as f32;
            fields[[j, x]] += (col_mean[x] - all_mean / 2.0) as f32;
        }
    }

    (fields, centered)
}

/// Distributes a field tensor evenly into the couplings, producing a
/// fieldless parameterization with identical per-sequence energies.
///
/// Each position takes part in `L - 1` pairs, so every incident pair
/// receives `h / (L - 1)`. The fieldless gauge is not unique; this is the
/// even representative.
///
/// # Panics
///
/// Panics if `fields` is not `(L, q)` or `couplings` is not `(P, q^2)`.
#[must_use]
pub fn fieldless_even(
    geom: &Geometry,
    fields: ArrayView2<f32>,
    couplings: ArrayView2<f32>,
) -> Array2<f32> {
    assert_eq!(
        fields.dim(),
        (geom.seq_len(), geom.num_letters()),
        "field tensor shape mismatch"
    );
    assert_eq!(
        couplings.dim(),
        (geom.num_pairs(), geom.num_states()),
        "coupling tensor shape mismatch"
    );

    let q = geom.num_letters();
    #[allow(clippy::cast_precision_loss)]
    let share = 1.0 / (geom.seq_len() - 1) as f32;
    let mut out = couplings.to_owned();

    for (n, (i, j)) in geom.pairs().enumerate() {
        for a in 0..q {
            for b in 0..q {
                out[[n, a * q + b]] += share * (fields[[i, a]] + fields[[j, b]]);
            }
        }
    }

    out
}

/// Total pair energy of one sequence, `sum_{i<j} J[(i,j), s_i q + s_j]`.
///
/// Accumulates in `f64`; this is the from-scratch reference the device
/// kernels are checked against.
///
/// # Panics
///
/// Panics if the sequence length does not match the geometry.
#[must_use]
pub fn pair_energy(geom: &Geometry, couplings: ArrayView2<f32>, seq: &[u8]) -> f32 {
    assert_eq!(seq.len(), geom.seq_len(), "sequence length mismatch");

    let q = geom.num_letters();
    let mut energy = 0.0_f64;
    for (n, (i, j)) in geom.pairs().enumerate() {
        energy += f64::from(couplings[[n, usize::from(seq[i]) * q + usize::from(seq[j])]]);
    }

    #[allow(clippy::cast_possible_truncation)]
    {
        energy as f32
    }
}

/// Total energy of one sequence under an `(h, J)` pair.
///
/// # Panics
///
/// Panics if the sequence length does not match the geometry.
#[must_use]
pub fn total_energy(
    geom: &Geometry,
    fields: ArrayView2<f32>,
    couplings: ArrayView2<f32>,
    seq: &[u8],
) -> f32 {
    let field_part: f64 = seq
        .iter()
        .enumerate()
        .map(|(i, &s)| f64::from(fields[[i, usize::from(s)]]))
        .sum();

    #[allow(clippy::cast_possible_truncation)]
    {
        (f64::from(pair_energy(geom, couplings, seq)) + field_part) as f32
    }
}
