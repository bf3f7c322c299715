#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! Inverse inference of pairwise Potts models.
//!
//! Given a target set of pairwise marginals, the engine alternates between
//! equilibrating a large population of Metropolis walkers under the current
//! coupling field and refining the couplings with quasi-Newton updates whose
//! trial marginals are estimated by importance-reweighting the equilibrated
//! population, so no new sampling is needed per trial.

pub mod bench;
pub mod buffers;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod gauge;
pub mod geometry;
pub mod kernels;
pub mod mcmc;
pub mod newton;
pub mod observables;
pub mod run;
pub mod seq;
