//! End-to-end scenarios at reduced scale: full sample-refine rounds,
//! pre-optimization, divergence detection, tempering bookkeeping, multi-
//! device pooling and packed-shadow coherence.

use float_cmp::assert_approx_eq;
use ndarray::Array2;
use pottsfit::buffers::{Role, SeqBuf};
use pottsfit::config::{McmcConfig, NewtonConfig, RunConfig};
use pottsfit::device::{wait_all, Device, Field};
use pottsfit::error::Error;
use pottsfit::gauge;
use pottsfit::geometry::Geometry;
use pottsfit::mcmc::McmcDriver;
use pottsfit::observables;
use pottsfit::run::{CouplingInit, Inference, PreoptPopulation, StartSeq};
use pottsfit::seq::Alphabet;
use rand::Rng;
use rand_pcg::Pcg64;

fn test_rng() -> Pcg64 {
    Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
}

fn uniform_target(geom: &Geometry) -> Array2<f32> {
    #[allow(clippy::cast_precision_loss)]
    Array2::from_elem(
        (geom.num_pairs(), geom.num_states()),
        1.0 / geom.num_states() as f32,
    )
}

fn small_config() -> RunConfig {
    RunConfig {
        mcmc: McmcConfig {
            equiltime: 16,
            sampletime: 4,
            nsamples: 4,
            nsteps: 1,
            trackequil: 8,
            tempering: None,
            nswaps: 0,
        },
        newton: NewtonConfig {
            gamma0: 4e-4,
            newton_steps: 8,
            ..NewtonConfig::default()
        },
        nwalkers: 128,
        ndevices: 2,
        seed: 1234,
        mcmcsteps: 2,
        resetseqs: true,
        preopt: false,
        preequiltime: 0,
    }
}

#[test]
fn uniform_target_run_writes_checkpoints_and_stays_bounded() {
    let geom = Geometry::new(6, 3);
    let alphabet: Alphabet = "ABC".parse().unwrap();
    let outdir = tempfile::tempdir().unwrap();

    let mut inference = Inference::new(
        geom,
        alphabet,
        small_config(),
        uniform_target(&geom),
        Some(outdir.path()),
    )
    .unwrap();
    let result = inference
        .run(CouplingInit::Zero, StartSeq::Random, None)
        .unwrap();

    // a uniform target is already satisfied by zero couplings, so the
    // refinement must not wander off
    assert!(result.couplings.iter().all(|j| j.abs() < 0.1));
    assert_eq!(result.startseq.len(), 6);

    assert!(outdir.path().join("startJ.npy").is_file());
    for name in ["run_0", "run_1"] {
        let dir = outdir.path().join(name);
        for file in [
            "J.npy",
            "bimarg.npy",
            "bicounts",
            "energies.npy",
            "startseq",
            "seqs-0",
            "seqs-1",
            "info.txt",
            "predictedBimarg.npy",
        ] {
            assert!(dir.join(file).is_file(), "{name}/{file} missing");
        }
        assert!(dir.join("equilibration").join("bimarg_1.npy").is_file());
        assert!(dir.join("equilibration").join("bimarg_2.npy").is_file());
    }
}

#[test]
fn preopt_refines_without_sampling() {
    let geom = Geometry::new(6, 3);
    let alphabet: Alphabet = "ABC".parse().unwrap();
    let outdir = tempfile::tempdir().unwrap();

    let cfg = RunConfig {
        mcmcsteps: 0,
        preopt: true,
        ..small_config()
    };
    let mut inference = Inference::new(
        geom,
        alphabet,
        cfg,
        uniform_target(&geom),
        Some(outdir.path()),
    )
    .unwrap();
    let result = inference
        .run(
            CouplingInit::IndependentLogOdds,
            StartSeq::FromPreopt,
            Some(PreoptPopulation::Random),
        )
        .unwrap();

    assert!(result.couplings.iter().all(|j| j.is_finite()));
    let preopt = outdir.path().join("preopt");
    for file in [
        "initJ.npy",
        "initbimarg.npy",
        "initBicount.npy",
        "seqs-0",
        "perturbedJ.npy",
        "perturbedbimarg.npy",
    ] {
        assert!(preopt.join(file).is_file(), "preopt/{file} missing");
    }
}

#[test]
fn preopt_adopts_the_first_given_sequence_as_seed() {
    let geom = Geometry::new(6, 3);
    let alphabet: Alphabet = "ABC".parse().unwrap();

    let cfg = RunConfig {
        mcmcsteps: 0,
        preopt: true,
        ..small_config()
    };
    let count = cfg.samples_per_device();
    let mut rng = test_rng();
    let per_device: Vec<Array2<u8>> = (0..cfg.ndevices)
        .map(|_| {
            Array2::from_shape_fn((count, geom.seq_len()), |_| rng.gen_range(0..3u8))
        })
        .collect();
    let expected = per_device[0].row(0).to_vec();

    let mut inference =
        Inference::new(geom, alphabet, cfg, uniform_target(&geom), None).unwrap();
    let result = inference
        .run(
            CouplingInit::Zero,
            StartSeq::FromPreopt,
            Some(PreoptPopulation::Given(per_device)),
        )
        .unwrap();

    assert_eq!(result.startseq, expected);
}

#[test]
fn runaway_learning_rate_raises_divergence() {
    let geom = Geometry::new(6, 3);
    let alphabet: Alphabet = "ABC".parse().unwrap();

    let cfg = RunConfig {
        mcmcsteps: 0,
        preopt: true,
        newton: NewtonConfig {
            gamma0: 1e4,
            pcdamping: 1e-8,
            newton_steps: 4,
            ..NewtonConfig::default()
        },
        ..small_config()
    };
    let mut inference =
        Inference::new(geom, alphabet, cfg, uniform_target(&geom), None).unwrap();
    let result = inference.run(
        CouplingInit::Zero,
        StartSeq::FromPreopt,
        Some(PreoptPopulation::Random),
    );

    assert!(matches!(result, Err(Error::Divergence(_))));
}

#[test]
fn missing_start_sequence_is_a_config_fault() {
    let geom = Geometry::new(6, 3);
    let alphabet: Alphabet = "ABC".parse().unwrap();

    let mut inference = Inference::new(
        geom,
        alphabet,
        small_config(),
        uniform_target(&geom),
        None,
    )
    .unwrap();
    let result = inference.run(CouplingInit::Zero, StartSeq::FromPreopt, None);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn tempering_preserves_the_primary_population() {
    let geom = Geometry::new(6, 3);
    let devices: Vec<Device> = (0..2)
        .map(|id| Device::new(id, 77 + id as u64, geom, 64, 256).unwrap())
        .collect();
    for device in &devices {
        device.fill_seqs(&[0, 1, 2, 0, 1, 2]).unwrap();
    }

    let mut driver = McmcDriver::new(McmcConfig {
        equiltime: 8,
        sampletime: 2,
        nsamples: 2,
        tempering: Some(vec![1.0, 0.5, 0.25, 0.125]),
        nswaps: 32,
        ..McmcConfig::default()
    });
    let mut rng = test_rng();
    driver.init_tempering(&devices, &mut rng).unwrap();

    let set = driver.sample(&devices, &mut rng, |_, _| Ok(())).unwrap();

    // swaps relabel walkers but never change the primary head count
    let betas = wait_all(devices.iter().map(Device::betas).collect()).unwrap();
    let primaries = betas
        .iter()
        .flatten()
        .filter(|&&b| (b - 1.0).abs() < 1e-6)
        .count();
    assert_eq!(primaries, 32);

    // with equal energies every proposed swap is accepted
    assert!(set.swap_rate > 0.0 && set.swap_rate <= 1.0);

    // only primary walkers were stored: 2 snapshots of the primaries
    let stored: usize = set.seqs.iter().map(Array2::nrows).sum();
    assert_eq!(stored, 2 * 32);
    for row in set.bicount.rows() {
        assert_eq!(row.iter().sum::<u32>(), 2 * 32);
    }
}

#[test]
fn pooled_marginals_match_a_single_device_holding_everything() {
    let geom = Geometry::new(7, 4);
    let mut rng = test_rng();
    let population = Array2::from_shape_fn((256, geom.seq_len()), |_| rng.gen_range(0..4u8));

    let single = Device::new(0, 1, geom, 64, 256).unwrap();
    single.set_seqs(SeqBuf::Large, population.view()).unwrap();
    single.calc_bicounts(SeqBuf::Large, false).unwrap();
    let direct = single.bicount().wait().unwrap();

    let pool: Vec<Device> = (0..2)
        .map(|id| Device::new(id, 2 + id as u64, geom, 64, 128).unwrap())
        .collect();
    for (id, device) in pool.iter().enumerate() {
        let half = population.slice(ndarray::s![id * 128..(id + 1) * 128, ..]);
        device.set_seqs(SeqBuf::Large, half).unwrap();
        device.calc_bicounts(SeqBuf::Large, false).unwrap();
    }
    let pooled =
        observables::sum_arrays(wait_all(pool.iter().map(Device::bicount).collect()).unwrap());

    assert_eq!(direct, pooled);

    let direct_marg = observables::normalize_bicounts(direct.view());
    for row in direct_marg.rows() {
        assert_approx_eq!(f32, row.sum(), 1.0, epsilon = 1e-6);
    }
}

#[test]
fn packed_shadow_stays_coherent_across_swaps_and_copies() {
    let geom = Geometry::new(6, 3);
    let device = Device::new(0, 3, geom, 64, 64).unwrap();
    let mut rng = test_rng();

    let walkers = Array2::from_shape_fn((64, geom.seq_len()), |_| rng.gen_range(0..3u8));
    device.set_seqs(SeqBuf::Small, walkers.view()).unwrap();

    let shape = (geom.num_pairs(), geom.num_states());
    let a = Array2::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0f32));
    let b = Array2::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0f32));
    device.set_couplings(Role::Front, a.clone()).unwrap();
    device.set_couplings(Role::Back, b.clone()).unwrap();

    let reference = |couplings: &Array2<f32>, row: usize| {
        gauge::pair_energy(&geom, couplings.view(), &walkers.row(row).to_vec())
    };

    // packs front (= a)
    device.calc_energies(SeqBuf::Small, Role::Front).unwrap();
    let energies = device.energies(SeqBuf::Small).wait().unwrap();
    assert_approx_eq!(f32, energies[0], reference(&a, 0), epsilon = 1e-4);

    // swap renames the shadow; front now holds b and must be repacked or
    // the renamed token must resolve correctly
    device.swap(Field::Couplings).unwrap();
    device.calc_energies(SeqBuf::Small, Role::Front).unwrap();
    let energies = device.energies(SeqBuf::Small).wait().unwrap();
    assert_approx_eq!(f32, energies[0], reference(&b, 0), epsilon = 1e-4);

    // a copy into the packed role invalidates the shadow
    device.copy(Field::Couplings, Role::Back, Role::Front).unwrap();
    device.calc_energies(SeqBuf::Small, Role::Front).unwrap();
    let energies = device.energies(SeqBuf::Small).wait().unwrap();
    assert_approx_eq!(f32, energies[0], reference(&a, 0), epsilon = 1e-4);
}

#[test]
fn gauge_roundtrips_preserve_energies_of_random_sequences() {
    let geom = Geometry::new(8, 4);
    let mut rng = test_rng();
    let couplings = Array2::from_shape_fn(
        (geom.num_pairs(), geom.num_states()),
        |_| rng.gen_range(-1.0..1.0f32),
    );
    let seqs: Vec<Vec<u8>> = (0..1000)
        .map(|_| (0..geom.seq_len()).map(|_| rng.gen_range(0..4u8)).collect())
        .collect();

    // the zero-J gauge round trip is exactly energy preserving
    let (fields, centered) = gauge::zero_j_gauge(&geom, couplings.view());
    let rebuilt = gauge::fieldless_even(&geom, fields.view(), centered.view());
    let mut worst = 0.0_f32;
    for seq in &seqs {
        let delta = (gauge::pair_energy(&geom, couplings.view(), seq)
            - gauge::pair_energy(&geom, rebuilt.view(), seq))
        .abs();
        worst = worst.max(delta);
    }
    assert!(worst <= 1e-3, "max energy deviation {worst}");

    // the canonical form row-centers the fields, which shifts every
    // sequence's energy by the same constant
    let (fields, centered) = gauge::zero_gauge(&geom, couplings.view());
    let canonical = gauge::fieldless_even(&geom, fields.view(), centered.view());
    let shifts: Vec<f32> = seqs
        .iter()
        .map(|seq| {
            gauge::pair_energy(&geom, couplings.view(), seq)
                - gauge::pair_energy(&geom, canonical.view(), seq)
        })
        .collect();
    let spread = shifts.iter().copied().fold(f32::NEG_INFINITY, f32::max)
        - shifts.iter().copied().fold(f32::INFINITY, f32::min);
    assert!(spread <= 1e-3, "gauge shift is not uniform: spread {spread}");
}
