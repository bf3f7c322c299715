//! Device contexts.
//!
//! A [`Device`] stands in for one accelerator: it owns the buffers of
//! [`crate::buffers`] behind a dedicated worker thread and an in-order
//! command queue, the same discipline as an in-order OpenCL queue. The host
//! enqueues kernels and transfers without blocking; downloads hand back a
//! [`Deferred`] whose [`wait`](Deferred::wait) blocks until the device has
//! drained the queue up to that point.
//!
//! Anything that kills a worker (a kernel panic) surfaces as
//! [`Error::Device`] at the next download or barrier; faults are propagated,
//! never retried.

use crate::buffers::{DeviceBuffers, Role, SeqBuf};
use crate::config::Regularization;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::kernels;
use crate::seq;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use ndarray::{s, Array1, Array2, ArrayView2};
use std::thread::JoinHandle;
use tracing::debug;

type Command = Box<dyn FnOnce(&mut DeviceBuffers) + Send>;

/// Handle to an asynchronous download; the value arrives once the device
/// reaches the transfer in program order.
#[derive(Debug)]
pub struct Deferred<T> {
    rx: Receiver<T>,
}

impl<T> Deferred<T> {
    /// Blocks until the device completes the download.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the device worker died before
    /// completing the transfer.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::Device("worker gone before download completed".to_owned()))
    }
}

/// Waits on a batch of downloads, one per device.
///
/// # Errors
///
/// Returns the first device fault encountered.
pub fn wait_all<T>(handles: Vec<Deferred<T>>) -> Result<Vec<T>> {
    handles.into_iter().map(Deferred::wait).collect()
}

/// Double-buffered parameter fields addressable by
/// [`swap`](Device::swap) / [`store`](Device::store) / [`copy`](Device::copy).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Field {
    /// The coupling tensors.
    Couplings,
    /// The pairwise-marginal tensors.
    Bimarg,
}

/// One simulated accelerator.
#[derive(Debug)]
pub struct Device {
    id: usize,
    seed: u64,
    geom: Geometry,
    nseq_small: usize,
    nseq_large: usize,
    queue: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Device {
    /// Spawns the worker and allocates its buffers: `nseq_small` live
    /// walkers and room for `nseq_large` accumulated samples.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker thread cannot be spawned.
    pub fn new(
        id: usize,
        seed: u64,
        geom: Geometry,
        nseq_small: usize,
        nseq_large: usize,
    ) -> Result<Self> {
        let (tx, rx): (Sender<Command>, Receiver<Command>) = unbounded();
        let worker = std::thread::Builder::new()
            .name(format!("device-{id}"))
            .spawn(move || {
                let mut bufs = DeviceBuffers::new(geom, nseq_small, nseq_large);
                while let Ok(cmd) = rx.recv() {
                    cmd(&mut bufs);
                }
            })?;

        debug!(device = id, seed, "device context up");

        Ok(Self {
            id,
            seed,
            geom,
            nseq_small,
            nseq_large,
            queue: Some(tx),
            worker: Some(worker),
        })
    }

    /// Device index within the pool.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// The geometry this device was allocated for.
    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geom
    }

    /// Number of live walkers on this device.
    #[must_use]
    pub const fn num_walkers(&self) -> usize {
        self.nseq_small
    }

    /// Capacity of the accumulated sample set.
    #[must_use]
    pub const fn sample_capacity(&self) -> usize {
        self.nseq_large
    }

    fn submit(&self, cmd: impl FnOnce(&mut DeviceBuffers) + Send + 'static) -> Result<()> {
        self.queue
            .as_ref()
            .and_then(|queue| queue.send(Box::new(cmd)).ok())
            .ok_or_else(|| Error::Device(format!("device {} queue is closed", self.id)))
    }

    fn download<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut DeviceBuffers) -> T + Send + 'static,
    ) -> Deferred<T> {
        let (tx, rx) = bounded(1);
        // a failed enqueue leaves the channel empty and surfaces at wait()
        let _ = self.submit(move |bufs| {
            let _ = tx.send(f(bufs));
        });
        Deferred { rx }
    }

    /// Barrier: blocks until every previously enqueued command finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the worker died.
    pub fn wait(&self) -> Result<()> {
        self.download(|_| ()).wait()
    }

    fn check_pair_shape(&self, what: &str, shape: (usize, usize)) -> Result<()> {
        let expected = (self.geom.num_pairs(), self.geom.num_states());
        if shape == expected {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{what} upload has shape {shape:?}, device expects {expected:?}"
            )))
        }
    }

    /// Uploads a coupling tensor into `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a shape mismatch.
    pub fn set_couplings(&self, role: Role, couplings: Array2<f32>) -> Result<()> {
        self.check_pair_shape("coupling", couplings.dim())?;
        debug!(device = self.id, ?role, "set couplings");
        self.submit(move |bufs| bufs.couplings_mut(role).assign(&couplings))
    }

    /// Downloads a coupling tensor.
    #[must_use]
    pub fn couplings(&self, role: Role) -> Deferred<Array2<f32>> {
        self.download(move |bufs| bufs.couplings(role).to_owned())
    }

    /// Uploads a marginal tensor into `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a shape mismatch.
    pub fn set_bimarg(&self, role: Role, bimarg: Array2<f32>) -> Result<()> {
        self.check_pair_shape("bimarg", bimarg.dim())?;
        self.submit(move |bufs| bufs.bimarg_mut(role).assign(&bimarg))
    }

    /// Downloads a marginal tensor.
    #[must_use]
    pub fn bimarg(&self, role: Role) -> Deferred<Array2<f32>> {
        self.download(move |bufs| bufs.bimarg(role).to_owned())
    }

    /// Uploads the target marginals; set once per run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a shape mismatch.
    pub fn set_bimarg_target(&self, target: Array2<f32>) -> Result<()> {
        self.check_pair_shape("target bimarg", target.dim())?;
        self.submit(move |bufs| bufs.bi_target.assign(&target))
    }

    /// Downloads the pair histogram of the last `calc_bicounts`.
    #[must_use]
    pub fn bicount(&self) -> Deferred<Array2<u32>> {
        self.download(|bufs| bufs.bicount.clone())
    }

    /// Uploads unpacked sequences (`nseq x L`) into a sequence buffer,
    /// packing them into the device layout on the way. An upload into the
    /// large buffer replaces the stored sample set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a shape mismatch.
    pub fn set_seqs(&self, which: SeqBuf, seqs: ArrayView2<u8>) -> Result<()> {
        let expected = match which {
            SeqBuf::Small => self.nseq_small,
            SeqBuf::Large => self.nseq_large,
        };
        if seqs.ncols() != self.geom.seq_len() || seqs.nrows() > expected {
            return Err(Error::Config(format!(
                "sequence upload has shape {:?}, device expects at most ({expected}, {})",
                seqs.dim(),
                self.geom.seq_len()
            )));
        }
        if which == SeqBuf::Small && seqs.nrows() != self.nseq_small {
            return Err(Error::Config(format!(
                "walker upload must fill all {} walkers, got {}",
                self.nseq_small,
                seqs.nrows()
            )));
        }

        let stored = seqs.nrows();
        let packed = seq::pack_seqs(&self.geom, seqs);
        self.submit(move |bufs| match which {
            SeqBuf::Small => bufs.seq_small.assign(&packed),
            SeqBuf::Large => {
                bufs.seq_large.slice_mut(s![.., ..stored]).assign(&packed);
                bufs.stored = stored;
            }
        })
    }

    /// Downloads and unpacks a sequence buffer; for the large buffer only
    /// the stored prefix is returned.
    #[must_use]
    pub fn seqs(&self, which: SeqBuf) -> Deferred<Array2<u8>> {
        let geom = self.geom;
        self.download(move |bufs| match which {
            SeqBuf::Small => seq::unpack_seqs(&geom, bufs.seq_small.view()),
            SeqBuf::Large => {
                seq::unpack_seqs(&geom, bufs.seq_large.slice(s![.., ..bufs.stored]))
            }
        })
    }

    /// Resets every walker to `startseq`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the sequence length is wrong.
    pub fn fill_seqs(&self, startseq: &[u8]) -> Result<()> {
        if startseq.len() != self.geom.seq_len() {
            return Err(Error::Config(format!(
                "start sequence has length {}, expected {}",
                startseq.len(),
                self.geom.seq_len()
            )));
        }

        let row = ArrayView2::from_shape((1, startseq.len()), startseq)
            .map_err(|err| Error::Config(err.to_string()))?;
        let column = seq::pack_seqs(&self.geom, row);
        self.submit(move |bufs| {
            for k in 0..bufs.nseq_small {
                bufs.seq_small.column_mut(k).assign(&column.column(0));
            }
        })
    }

    /// Downloads per-walker energies; for the large buffer only the stored
    /// prefix.
    #[must_use]
    pub fn energies(&self, which: SeqBuf) -> Deferred<Array1<f32>> {
        self.download(move |bufs| match which {
            SeqBuf::Small => bufs.energy_small.clone(),
            SeqBuf::Large => bufs.energy_large.slice(s![..bufs.stored]).to_owned(),
        })
    }

    /// Downloads the importance weights of the stored sample set.
    #[must_use]
    pub fn weights(&self) -> Deferred<Array1<f32>> {
        self.download(|bufs| bufs.weights.slice(s![..bufs.stored]).to_owned())
    }

    /// Downloads the effective sample count of the last reweighting.
    #[must_use]
    pub fn neff(&self) -> Deferred<f32> {
        self.download(|bufs| bufs.neff)
    }

    /// Writes the per-walker inverse temperatures; walkers at `b0` are
    /// marked primary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the label count is wrong.
    pub fn set_betas(&self, betas: Array1<f32>, b0: f32) -> Result<()> {
        if betas.len() != self.nseq_small {
            return Err(Error::Config(format!(
                "{} temperature labels for {} walkers",
                betas.len(),
                self.nseq_small
            )));
        }

        self.submit(move |bufs| {
            #[allow(clippy::float_cmp)]
            let primary: Vec<bool> = betas.iter().map(|&b| b == b0).collect();
            bufs.betas = betas;
            bufs.primary = primary;
        })
    }

    /// Downloads the per-walker inverse temperatures.
    #[must_use]
    pub fn betas(&self) -> Deferred<Array1<f32>> {
        self.download(|bufs| bufs.betas.clone())
    }

    /// Empties the large sample buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn clear_large(&self) -> Result<()> {
        self.submit(DeviceBuffers::clear_large)
    }

    /// Dispatches one Metropolis launch: every walker advances by
    /// `nsteps * L` single-site proposals under the main couplings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn run_mcmc(&self, run_seed: u64, nsteps: usize) -> Result<()> {
        let seed = self.seed;
        debug!(device = self.id, run_seed, "metropolis");
        self.submit(move |bufs| kernels::metropolis(bufs, seed, run_seed, nsteps))
    }

    /// Dispatches the pair-histogram kernel over a sequence population.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn calc_bicounts(&self, which: SeqBuf, marked_only: bool) -> Result<()> {
        debug!(device = self.id, ?which, marked_only, "countBimarg");
        self.submit(move |bufs| kernels::count_bimarg(bufs, which, marked_only))
    }

    /// Dispatches the energy kernel for a population under `jrole`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn calc_energies(&self, which: SeqBuf, jrole: Role) -> Result<()> {
        debug!(device = self.id, ?which, ?jrole, "getEnergies");
        self.submit(move |bufs| kernels::get_energies(bufs, which, jrole))
    }

    /// Re-estimates the front marginals from the stored sample set by
    /// importance reweighting against the trial couplings in `back`:
    /// weights, `Neff`, then the weighted histogram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn perturb_marg(&self) -> Result<()> {
        debug!(device = self.id, "perturbMarg");
        self.submit(|bufs| {
            kernels::perturbed_weights(bufs);
            kernels::sum_weights(bufs);
            kernels::weighted_marg(bufs);
        })
    }

    /// Dispatches the coupling update kernel, writing the trial into
    /// `front` from the last accepted state in `back`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn update_couplings(
        &self,
        gamma: f32,
        pc: f32,
        regularization: Option<Regularization>,
    ) -> Result<()> {
        debug!(device = self.id, gamma, "updateJ");
        self.submit(move |bufs| match regularization {
            Some(reg) => kernels::update_j_weightfn(bufs, gamma, pc, reg.fn_lmbda, reg.fn_s),
            None => kernels::update_j(bufs, gamma, pc),
        })
    }

    /// Appends the primary walkers to the large sample set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn store_seqs(&self) -> Result<()> {
        self.submit(kernels::store_seqs)
    }

    /// Swaps the front/back pair of a field in O(1).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn swap(&self, field: Field) -> Result<()> {
        self.submit(move |bufs| match field {
            Field::Couplings => bufs.swap_couplings(),
            Field::Bimarg => bufs.swap_bimarg(),
        })
    }

    /// Stores front into back for a field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn store(&self, field: Field) -> Result<()> {
        self.submit(move |bufs| match field {
            Field::Couplings => bufs.store_couplings(),
            Field::Bimarg => bufs.store_bimarg(),
        })
    }

    /// Device-internal copy between two roles of a field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the queue is closed.
    pub fn copy(&self, field: Field, src: Role, dst: Role) -> Result<()> {
        self.submit(move |bufs| match field {
            Field::Couplings => bufs.copy_couplings(src, dst),
            Field::Bimarg => bufs.copy_bimarg(src, dst),
        })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
