//! Per-device buffer store and double-buffer discipline.
//!
//! Each device owns a fixed set of named typed buffers. The coupling and
//! marginal tensors come in three roles — `main` is what MCMC samples under,
//! while `front`/`back` form the trial/last-accepted pair of the Newton
//! refiner: a trial overwrites `front`, the pair is swapped to evaluate, and
//! on acceptance `front` is stored into `back`.
//!
//! Couplings additionally have a packed `L^2 x q^2` shadow in the layout the
//! kernels consume. The shadow is valid for at most one role at a time; the
//! single validity token is renamed by [`swap`](DeviceBuffers::swap_couplings)
//! and cleared by every write to the packed role.

use crate::geometry::Geometry;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2};

/// Buffer role of a double-buffered parameter field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Currently accepted state, used by MCMC.
    Main,
    /// Trial scratch during Newton refinement.
    Front,
    /// Last accepted state during Newton refinement.
    Back,
}

/// Selects one of the two sequence populations of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeqBuf {
    /// The live walker states advanced by the Metropolis kernel.
    Small,
    /// The accumulated post-equilibration sample set.
    Large,
}

/// The typed buffers owned by one device.
#[derive(Debug)]
pub struct DeviceBuffers {
    pub(crate) geom: Geometry,
    pub(crate) nseq_small: usize,
    pub(crate) nseq_large: usize,

    pub(crate) j_main: Array2<f32>,
    pub(crate) j_front: Array2<f32>,
    pub(crate) j_back: Array2<f32>,
    pub(crate) bi_main: Array2<f32>,
    pub(crate) bi_front: Array2<f32>,
    pub(crate) bi_back: Array2<f32>,
    pub(crate) bi_target: Array2<f32>,
    pub(crate) bicount: Array2<u32>,

    pub(crate) seq_small: Array2<u32>,
    pub(crate) seq_large: Array2<u32>,
    /// Number of sequences currently stored in the large buffer.
    pub(crate) stored: usize,

    pub(crate) energy_small: Array1<f32>,
    pub(crate) energy_large: Array1<f32>,
    pub(crate) weights: Array1<f32>,
    pub(crate) neff: f32,

    /// Per-walker inverse temperature; `1.0` marks the primary ensemble
    /// unless a tempering ladder says otherwise.
    pub(crate) betas: Array1<f32>,
    /// Whether each walker currently carries the primary temperature.
    pub(crate) primary: Vec<bool>,

    pub(crate) packed_j: Array2<f32>,
    pub(crate) packed_role: Option<Role>,
}

impl DeviceBuffers {
    /// Allocates all buffers for `nseq_small` walkers and a sample capacity
    /// of `nseq_large` sequences.
    #[must_use]
    pub fn new(geom: Geometry, nseq_small: usize, nseq_large: usize) -> Self {
        let pair_shape = (geom.num_pairs(), geom.num_states());
        let seq_len = geom.seq_len();

        Self {
            geom,
            nseq_small,
            nseq_large,
            j_main: Array2::zeros(pair_shape),
            j_front: Array2::zeros(pair_shape),
            j_back: Array2::zeros(pair_shape),
            bi_main: Array2::zeros(pair_shape),
            bi_front: Array2::zeros(pair_shape),
            bi_back: Array2::zeros(pair_shape),
            bi_target: Array2::zeros(pair_shape),
            bicount: Array2::zeros(pair_shape),
            seq_small: Array2::zeros((geom.seq_words(), nseq_small)),
            seq_large: Array2::zeros((geom.seq_words(), nseq_large)),
            stored: 0,
            energy_small: Array1::zeros(nseq_small),
            energy_large: Array1::zeros(nseq_large),
            weights: Array1::zeros(nseq_large),
            neff: 0.0,
            betas: Array1::from_elem(nseq_small, 1.0),
            primary: vec![true; nseq_small],
            packed_j: Array2::zeros((seq_len * seq_len, geom.num_states())),
            packed_role: None,
        }
    }

    /// The geometry these buffers were allocated for.
    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geom
    }

    /// Number of sequences a population holds right now: the walker count
    /// for [`SeqBuf::Small`], the stored count for [`SeqBuf::Large`].
    #[must_use]
    pub const fn nseq(&self, which: SeqBuf) -> usize {
        match which {
            SeqBuf::Small => self.nseq_small,
            SeqBuf::Large => self.stored,
        }
    }

    /// Read access to a coupling buffer.
    #[must_use]
    pub fn couplings(&self, role: Role) -> ArrayView2<'_, f32> {
        match role {
            Role::Main => self.j_main.view(),
            Role::Front => self.j_front.view(),
            Role::Back => self.j_back.view(),
        }
    }

    /// Write access to a coupling buffer. Invalidates the packed shadow when
    /// it covers `role`.
    pub fn couplings_mut(&mut self, role: Role) -> ArrayViewMut2<'_, f32> {
        self.note_couplings_write(role);
        match role {
            Role::Main => self.j_main.view_mut(),
            Role::Front => self.j_front.view_mut(),
            Role::Back => self.j_back.view_mut(),
        }
    }

    /// Read access to a marginal buffer.
    #[must_use]
    pub fn bimarg(&self, role: Role) -> ArrayView2<'_, f32> {
        match role {
            Role::Main => self.bi_main.view(),
            Role::Front => self.bi_front.view(),
            Role::Back => self.bi_back.view(),
        }
    }

    /// Write access to a marginal buffer.
    pub fn bimarg_mut(&mut self, role: Role) -> ArrayViewMut2<'_, f32> {
        match role {
            Role::Main => self.bi_main.view_mut(),
            Role::Front => self.bi_front.view_mut(),
            Role::Back => self.bi_back.view_mut(),
        }
    }

    /// Records that the coupling buffer `role` is about to be written,
    /// clearing the packed-shadow token if it covers that role.
    pub(crate) fn note_couplings_write(&mut self, role: Role) {
        if self.packed_role == Some(role) {
            self.packed_role = None;
        }
    }

    /// The role whose packed expansion is currently valid, if any.
    #[must_use]
    pub const fn packed_role(&self) -> Option<Role> {
        self.packed_role
    }

    /// Swaps the front/back coupling pair in O(1) and renames the packed
    /// token accordingly.
    pub fn swap_couplings(&mut self) {
        std::mem::swap(&mut self.j_front, &mut self.j_back);
        self.packed_role = match self.packed_role {
            Some(Role::Front) => Some(Role::Back),
            Some(Role::Back) => Some(Role::Front),
            other => other,
        };
    }

    /// Swaps the front/back marginal pair in O(1).
    pub fn swap_bimarg(&mut self) {
        std::mem::swap(&mut self.bi_front, &mut self.bi_back);
    }

    /// Copies the front coupling buffer into back (the "store" operation of
    /// an accepted Newton step).
    pub fn store_couplings(&mut self) {
        self.note_couplings_write(Role::Back);
        let (front, back) = (&self.j_front, &mut self.j_back);
        back.assign(front);
    }

    /// Copies the front marginal buffer into back.
    pub fn store_bimarg(&mut self) {
        let (front, back) = (&self.bi_front, &mut self.bi_back);
        back.assign(front);
    }

    /// Device-internal copy between coupling roles.
    ///
    /// # Panics
    ///
    /// Panics if `src == dst`.
    pub fn copy_couplings(&mut self, src: Role, dst: Role) {
        assert_ne!(src, dst, "copy onto itself");
        self.note_couplings_write(dst);
        let src = self.couplings(src).to_owned();
        match dst {
            Role::Main => self.j_main.assign(&src),
            Role::Front => self.j_front.assign(&src),
            Role::Back => self.j_back.assign(&src),
        }
    }

    /// Device-internal copy between marginal roles.
    ///
    /// # Panics
    ///
    /// Panics if `src == dst`.
    pub fn copy_bimarg(&mut self, src: Role, dst: Role) {
        assert_ne!(src, dst, "copy onto itself");
        let src = self.bimarg(src).to_owned();
        match dst {
            Role::Main => self.bi_main.assign(&src),
            Role::Front => self.bi_front.assign(&src),
            Role::Back => self.bi_back.assign(&src),
        }
    }

    /// Empties the large sequence buffer.
    pub fn clear_large(&mut self) {
        self.stored = 0;
    }
}
