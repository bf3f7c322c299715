//! CPU realization of the accelerator kernel bundle.
//!
//! Each function mirrors one kernel of the device program: it declares which
//! buffers it reads and writes through its use of [`DeviceBuffers`], and any
//! kernel that consumes packed couplings establishes the packed shadow for
//! the role it dispatches with. All arithmetic on device-visible tensors is
//! `f32`; energies therefore drift on the order of `1e-4` relative between
//! Metropolis propagation and from-scratch recomputation.

use crate::buffers::{DeviceBuffers, Role, SeqBuf};
use crate::geometry::Geometry;
use crate::seq;
use ndarray::{Array1, Array2, ArrayView2, Zip};
use rand::Rng;
use rand_pcg::Pcg64;
use rayon::prelude::*;

/// Walker-group granularity of the Metropolis kernel; walker counts must be
/// a multiple of this per device.
pub const WALKER_GROUP: usize = 64;

/// Derives the PRNG stream of one walker for one kernel launch.
fn walker_rng(device_seed: u64, run_seed: u64, walker: u64) -> Pcg64 {
    let state = (u128::from(device_seed) << 64) | u128::from(run_seed);
    Pcg64::new(state, 0xa02bdbf7bb3c0a7ac28fa16a64abf96 ^ u128::from(walker))
}

/// Pair energy of packed walker `k`, accumulated in `f32` like the device
/// does.
fn packed_energy(geom: &Geometry, packed: &Array2<f32>, mem: &ArrayView2<u32>, k: usize) -> f32 {
    let (l, q) = (geom.seq_len(), geom.num_letters());
    let mut energy = 0.0_f32;

    for i in 0..l - 1 {
        let si = usize::from(seq::packed_get(mem, k, i));
        for j in i + 1..l {
            let sj = usize::from(seq::packed_get(mem, k, j));
            energy += packed[[l * i + j, si * q + sj]];
        }
    }

    energy
}

/// `packfV`: expands a `P x q^2` coupling tensor into the dense `L^2 x q^2`
/// form the other kernels consume, and marks the shadow valid for `role`.
/// Memoized: a shadow already covering `role` is left untouched.
pub fn pack_fv(bufs: &mut DeviceBuffers, role: Role) {
    if bufs.packed_role == Some(role) {
        return;
    }

    let geom = bufs.geom;
    let (l, q) = (geom.seq_len(), geom.num_letters());
    let src = match role {
        Role::Main => &bufs.j_main,
        Role::Front => &bufs.j_front,
        Role::Back => &bufs.j_back,
    };
    let packed = &mut bufs.packed_j;

    for (n, (i, j)) in geom.pairs().enumerate() {
        for a in 0..q {
            for b in 0..q {
                let value = src[[n, a * q + b]];
                packed[[l * i + j, a * q + b]] = value;
                packed[[l * j + i, b * q + a]] = value;
            }
        }
    }

    bufs.packed_role = Some(role);
}

/// `metropolis`: advances every walker of the small buffer by `nsteps * L`
/// single-site proposals under the main couplings, with the per-walker
/// inverse temperature entering the acceptance term.
///
/// Walker energies are recomputed from scratch on entry, which re-zeros any
/// floating-point error accumulated by earlier launches, then tracked
/// incrementally.
pub fn metropolis(bufs: &mut DeviceBuffers, device_seed: u64, run_seed: u64, nsteps: usize) {
    pack_fv(bufs, Role::Main);

    let geom = bufs.geom;
    let (l, q) = (geom.seq_len(), geom.num_letters());
    let unpacked = seq::unpack_seqs(&geom, bufs.seq_small.view());
    let betas = bufs.betas.to_vec();
    let mut energies = vec![0.0_f32; bufs.nseq_small];
    let mut letters = unpacked.into_raw_vec_and_offset().0;

    {
        let packed = &bufs.packed_j;
        letters
            .par_chunks_mut(l)
            .zip(energies.par_iter_mut())
            .enumerate()
            .for_each(|(k, (walker, energy))| {
                let mut rng = walker_rng(device_seed, run_seed, k as u64);
                let beta = betas[k];

                let mut current = 0.0_f32;
                for i in 0..l - 1 {
                    for j in i + 1..l {
                        current += packed
                            [[l * i + j, usize::from(walker[i]) * q + usize::from(walker[j])]];
                    }
                }

                for _ in 0..nsteps * l {
                    let pos = rng.gen_range(0..l);
                    let old = usize::from(walker[pos]);
                    let new = rng.gen_range(0..q);
                    if new == old {
                        continue;
                    }

                    let mut delta = 0.0_f32;
                    for m in 0..l {
                        if m == pos {
                            continue;
                        }
                        let sm = usize::from(walker[m]);
                        let row = l * pos + m;
                        delta += packed[[row, new * q + sm]] - packed[[row, old * q + sm]];
                    }

                    if delta <= 0.0 || rng.gen_range(0.0..1.0_f32) < (-beta * delta).exp() {
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            walker[pos] = new as u8;
                        }
                        current += delta;
                    }
                }

                *energy = current;
            });
    }

    let rows = Array2::from_shape_vec((bufs.nseq_small, l), letters)
        .unwrap_or_else(|_| unreachable!());
    bufs.seq_small = seq::pack_seqs(&geom, rows.view());
    bufs.energy_small = Array1::from(energies);
}

/// `countBimarg`: histograms letter pairs over a sequence population into
/// `bicount` and writes the normalized result to `bi main`.
///
/// With `marked_only` set, only walkers carrying the primary temperature are
/// counted (small buffer only; the large buffer already holds primary
/// samples exclusively).
pub fn count_bimarg(bufs: &mut DeviceBuffers, which: SeqBuf, marked_only: bool) {
    let geom = bufs.geom;
    let q = geom.num_letters();
    let nseq = bufs.nseq(which);

    let hists: Vec<Vec<u32>> = {
        let mem = match which {
            SeqBuf::Small => bufs.seq_small.view(),
            SeqBuf::Large => bufs.seq_large.view(),
        };
        let mask = (marked_only && which == SeqBuf::Small).then_some(&bufs.primary);
        let pairs: Vec<(usize, usize)> = geom.pairs().collect();

        pairs
            .par_iter()
            .map(|&(i, j)| {
                let mut hist = vec![0_u32; q * q];
                for k in 0..nseq {
                    if mask.map_or(true, |m| m[k]) {
                        let si = usize::from(seq::packed_get(&mem, k, i));
                        let sj = usize::from(seq::packed_get(&mem, k, j));
                        hist[si * q + sj] += 1;
                    }
                }
                hist
            })
            .collect()
    };

    let counted: u32 = hists.first().map_or(0, |h| h.iter().sum());
    for (n, hist) in hists.into_iter().enumerate() {
        for (s, &count) in hist.iter().enumerate() {
            bufs.bicount[[n, s]] = count;
            #[allow(clippy::cast_precision_loss)]
            {
                bufs.bi_main[[n, s]] = if counted == 0 {
                    0.0
                } else {
                    count as f32 / counted as f32
                };
            }
        }
    }
}

/// `getEnergies`: recomputes the per-walker pair energies of a population
/// under the packed form of `jrole`.
pub fn get_energies(bufs: &mut DeviceBuffers, which: SeqBuf, jrole: Role) {
    pack_fv(bufs, jrole);

    let geom = bufs.geom;
    let nseq = bufs.nseq(which);
    let energies: Vec<f32> = {
        let mem = match which {
            SeqBuf::Small => bufs.seq_small.view(),
            SeqBuf::Large => bufs.seq_large.view(),
        };
        let packed = &bufs.packed_j;
        (0..nseq)
            .into_par_iter()
            .map(|k| packed_energy(&geom, packed, &mem, k))
            .collect()
    };

    let buffer = match which {
        SeqBuf::Small => &mut bufs.energy_small,
        SeqBuf::Large => &mut bufs.energy_large,
    };
    for (k, energy) in energies.into_iter().enumerate() {
        buffer[k] = energy;
    }
}

/// `perturbedWeights`: importance weight of every stored sequence for the
/// trial couplings in `back`, relative to the cached reference energies.
pub fn perturbed_weights(bufs: &mut DeviceBuffers) {
    pack_fv(bufs, Role::Back);

    let geom = bufs.geom;
    let nseq = bufs.stored;
    let weights: Vec<f32> = {
        let mem = bufs.seq_large.view();
        let packed = &bufs.packed_j;
        let reference = &bufs.energy_large;
        (0..nseq)
            .into_par_iter()
            .map(|k| (-(packed_energy(&geom, packed, &mem, k) - reference[k])).exp())
            .collect()
    };

    for (k, weight) in weights.into_iter().enumerate() {
        bufs.weights[k] = weight;
    }
}

/// `sumWeights`: reduces the weights into the effective sample count
/// `Neff = sum(w)`.
pub fn sum_weights(bufs: &mut DeviceBuffers) {
    let total: f64 = bufs
        .weights
        .iter()
        .take(bufs.stored)
        .map(|&w| f64::from(w))
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    {
        bufs.neff = total as f32;
    }
}

/// `weightedMarg`: importance-weighted pairwise marginals over the stored
/// sample set, normalized by `Neff`, written to `bi front`.
pub fn weighted_marg(bufs: &mut DeviceBuffers) {
    let geom = bufs.geom;
    let q = geom.num_letters();
    let nseq = bufs.stored;
    let neff = f64::from(bufs.neff);

    let rows: Vec<Vec<f64>> = {
        let mem = bufs.seq_large.view();
        let weights = &bufs.weights;
        let pairs: Vec<(usize, usize)> = geom.pairs().collect();

        pairs
            .par_iter()
            .map(|&(i, j)| {
                let mut hist = vec![0.0_f64; q * q];
                for k in 0..nseq {
                    let si = usize::from(seq::packed_get(&mem, k, i));
                    let sj = usize::from(seq::packed_get(&mem, k, j));
                    hist[si * q + sj] += f64::from(weights[k]);
                }
                hist
            })
            .collect()
    };

    for (n, hist) in rows.into_iter().enumerate() {
        for (s, &mass) in hist.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                bufs.bi_front[[n, s]] = if neff == 0.0 { 0.0 } else { (mass / neff) as f32 };
            }
        }
    }
}

/// `updateJ`: element-wise quasi-Newton step from the last accepted state,
/// `J' = J_back + gamma * (B_target - B_back) / (B_back + pc)`, written to
/// `J front`.
pub fn update_j(bufs: &mut DeviceBuffers, gamma: f32, pc: f32) {
    bufs.note_couplings_write(Role::Front);
    let (front, back, target, bi_back) = (
        &mut bufs.j_front,
        &bufs.j_back,
        &bufs.bi_target,
        &bufs.bi_back,
    );

    Zip::from(front)
        .and(back)
        .and(target)
        .and(bi_back)
        .for_each(|f, &j, &t, &b| {
            *f = j + gamma * (t - b) / (b + pc);
        });
}

/// `updateJ_weightfn`: the regularized update. On top of the plain step the
/// couplings are shrunk toward zero with strength `fn_lmbda`, damped away
/// for couplings much larger than the scale `fn_s`.
pub fn update_j_weightfn(bufs: &mut DeviceBuffers, gamma: f32, pc: f32, fn_lmbda: f32, fn_s: f32) {
    bufs.note_couplings_write(Role::Front);
    let (front, back, target, bi_back) = (
        &mut bufs.j_front,
        &bufs.j_back,
        &bufs.bi_target,
        &bufs.bi_back,
    );

    Zip::from(front)
        .and(back)
        .and(target)
        .and(bi_back)
        .for_each(|f, &j, &t, &b| {
            *f = j + gamma * ((t - b) / (b + pc) - fn_lmbda * j * (-j.abs() / fn_s).exp());
        });
}

/// `storeSeqs`: appends the primary walkers of the small buffer to the large
/// sample set.
///
/// # Panics
///
/// Panics when the large buffer capacity would be exceeded.
pub fn store_seqs(bufs: &mut DeviceBuffers) {
    let words = bufs.geom.seq_words();
    let mut offset = bufs.stored;

    for k in 0..bufs.nseq_small {
        if bufs.primary[k] {
            assert!(offset < bufs.nseq_large, "large sequence buffer overflow");
            for w in 0..words {
                bufs.seq_large[[w, offset]] = bufs.seq_small[[w, k]];
            }
            offset += 1;
        }
    }

    bufs.stored = offset;
}

#[cfg(test)]
mod tests {
    use super::{
        count_bimarg, get_energies, metropolis, pack_fv, packed_energy, perturbed_weights,
        store_seqs, sum_weights, update_j, weighted_marg,
    };
    use crate::buffers::{DeviceBuffers, Role, SeqBuf};
    use crate::gauge;
    use crate::geometry::Geometry;
    use crate::seq;
    use float_cmp::assert_approx_eq;
    use ndarray::Array2;
    use rand::Rng;
    use rand_pcg::Pcg64;

    fn test_rng() -> Pcg64 {
        Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
    }

    fn random_state(geom: Geometry, nseq_small: usize, nseq_large: usize) -> DeviceBuffers {
        let mut rng = test_rng();
        let mut bufs = DeviceBuffers::new(geom, nseq_small, nseq_large);
        bufs.couplings_mut(Role::Main).mapv_inplace(|_| rng.gen_range(-0.5..0.5));
        let seqs = Array2::from_shape_fn((nseq_small, geom.seq_len()), |_| {
            rng.gen_range(0..geom.num_letters()) as u8
        });
        bufs.seq_small = seq::pack_seqs(&geom, seqs.view());
        bufs
    }

    #[test]
    fn packed_energies_match_reference() {
        let geom = Geometry::new(9, 4);
        let mut bufs = random_state(geom, 32, 32);
        pack_fv(&mut bufs, Role::Main);

        let rows = seq::unpack_seqs(&geom, bufs.seq_small.view());
        for k in 0..32 {
            let from_packed = packed_energy(&geom, &bufs.packed_j, &bufs.seq_small.view(), k);
            let reference = gauge::pair_energy(&geom, bufs.couplings(Role::Main), &rows.row(k).to_vec());
            assert_approx_eq!(f32, from_packed, reference, epsilon = 1e-4);
        }
    }

    #[test]
    fn metropolis_tracks_energies_consistently() {
        let geom = Geometry::new(8, 4);
        let mut bufs = random_state(geom, 64, 64);

        metropolis(&mut bufs, 7, 1, 4);
        let tracked = bufs.energy_small.clone();

        get_energies(&mut bufs, SeqBuf::Small, Role::Main);
        for (t, r) in tracked.iter().zip(&bufs.energy_small) {
            assert_approx_eq!(f32, *t, *r, epsilon = 1e-3);
        }
    }

    #[test]
    fn metropolis_is_deterministic_in_the_seeds() {
        let geom = Geometry::new(6, 3);
        let mut a = random_state(geom, 32, 32);
        let mut b = random_state(geom, 32, 32);

        metropolis(&mut a, 11, 3, 2);
        metropolis(&mut b, 11, 3, 2);
        assert_eq!(a.seq_small, b.seq_small);

        metropolis(&mut b, 11, 4, 2);
        assert_ne!(a.seq_small, b.seq_small);
    }

    #[test]
    fn bicount_rows_sum_to_walker_count() {
        let geom = Geometry::new(7, 4);
        let mut bufs = random_state(geom, 48, 48);

        count_bimarg(&mut bufs, SeqBuf::Small, false);
        for row in bufs.bicount.rows() {
            assert_eq!(row.iter().sum::<u32>(), 48);
        }
        for row in bufs.bimarg(Role::Main).rows() {
            assert_approx_eq!(f32, row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn reweighting_a_trivial_trial_is_exact() {
        let geom = Geometry::new(6, 3);
        let mut bufs = random_state(geom, 32, 32);

        // populate the large buffer and cache reference energies
        store_seqs(&mut bufs);
        get_energies(&mut bufs, SeqBuf::Large, Role::Main);

        // a trial identical to the sampling couplings
        bufs.copy_couplings(Role::Main, Role::Back);
        perturbed_weights(&mut bufs);
        sum_weights(&mut bufs);

        for &w in bufs.weights.iter().take(bufs.stored) {
            assert_approx_eq!(f32, w, 1.0, ulps = 0);
        }
        assert_approx_eq!(f32, bufs.neff, 32.0, ulps = 0);

        weighted_marg(&mut bufs);
        count_bimarg(&mut bufs, SeqBuf::Large, false);
        for (w, d) in bufs.bi_front.iter().zip(&bufs.bi_main) {
            assert_approx_eq!(f32, *w, *d, ulps = 0);
        }
    }

    #[test]
    fn update_rule_matches_formula() {
        let geom = Geometry::new(3, 2);
        let mut bufs = DeviceBuffers::new(geom, 8, 8);
        bufs.couplings_mut(Role::Back).fill(0.5);
        bufs.bimarg_mut(Role::Back).fill(0.2);
        bufs.bi_target.fill(0.25);

        update_j(&mut bufs, 0.1, 1e-3);
        let expected = 0.5 + 0.1 * (0.25 - 0.2) / (0.2 + 1e-3);
        for &j in &bufs.j_front {
            assert_approx_eq!(f32, j, expected, ulps = 2);
        }
    }

    #[test]
    fn store_seqs_respects_primary_marks() {
        let geom = Geometry::new(5, 3);
        let mut bufs = random_state(geom, 16, 32);
        for k in 0..16 {
            bufs.primary[k] = k % 2 == 0;
        }

        store_seqs(&mut bufs);
        assert_eq!(bufs.stored, 8);

        let large = seq::unpack_seqs(&geom, bufs.seq_large.view());
        let small = seq::unpack_seqs(&geom, bufs.seq_small.view());
        assert_eq!(large.row(0), small.row(0));
        assert_eq!(large.row(1), small.row(2));
    }
}
