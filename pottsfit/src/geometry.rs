//! Pair geometry of a fixed-length Potts system.
//!
//! All coupling and marginal tensors are indexed by an ordered pair index `n`
//! enumerating the position pairs `(i, j)` with `i < j` in row-major order
//! over `i`. This module is the single source of truth for that convention.

use crate::error::{Error, Result};
use itertools::Itertools;

/// Largest representable alphabet; sequences store one letter per byte.
pub const MAX_LETTERS: usize = 256;

/// Dimensions of a Potts system: sequence length `L` and alphabet size `q`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    seq_len: usize,
    num_letters: usize,
}

impl Geometry {
    /// Constructs the geometry for sequences of length `seq_len` over an
    /// alphabet of `num_letters` letters.
    ///
    /// # Panics
    ///
    /// Panics if `seq_len < 2`, `num_letters < 2` or `num_letters` exceeds
    /// [`MAX_LETTERS`].
    #[must_use]
    pub fn new(seq_len: usize, num_letters: usize) -> Self {
        assert!(seq_len >= 2, "sequences must have at least two positions");
        assert!(
            (2..=MAX_LETTERS).contains(&num_letters),
            "alphabet size must be in 2..={MAX_LETTERS}"
        );

        Self {
            seq_len,
            num_letters,
        }
    }

    /// Recovers the geometry from the shape `(P, q^2)` of a pairwise-marginal
    /// or coupling tensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `num_pairs` is not a triangular number
    /// `L(L-1)/2` or `num_states` is not a perfect square.
    pub fn from_tensor_shape(num_pairs: usize, num_states: usize) -> Result<Self> {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_precision_loss)]
        let seq_len = ((1.0 + (1.0 + 8.0 * num_pairs as f64).sqrt()) / 2.0 + 0.5) as usize;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_precision_loss)]
        let num_letters = ((num_states as f64).sqrt() + 0.5) as usize;

        if seq_len < 2 || seq_len * (seq_len - 1) / 2 != num_pairs {
            return Err(Error::Config(format!(
                "{num_pairs} rows do not form a pair tensor: not a triangular number"
            )));
        }
        if !(2..=MAX_LETTERS).contains(&num_letters) || num_letters * num_letters != num_states {
            return Err(Error::Config(format!(
                "{num_states} columns do not form a q x q block"
            )));
        }

        Ok(Self {
            seq_len,
            num_letters,
        })
    }

    /// Sequence length `L`.
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Alphabet size `q`.
    #[must_use]
    pub const fn num_letters(&self) -> usize {
        self.num_letters
    }

    /// Number of ordered position pairs `P = L(L-1)/2`.
    #[must_use]
    pub const fn num_pairs(&self) -> usize {
        self.seq_len * (self.seq_len - 1) / 2
    }

    /// Number of states per pair, `q^2`.
    #[must_use]
    pub const fn num_states(&self) -> usize {
        self.num_letters * self.num_letters
    }

    /// Number of scalar couplings, `P * q^2`.
    #[must_use]
    pub const fn num_couplings(&self) -> usize {
        self.num_pairs() * self.num_states()
    }

    /// Number of 32-bit words a packed sequence occupies.
    #[must_use]
    pub const fn seq_words(&self) -> usize {
        (self.seq_len - 1) / 4 + 1
    }

    /// Enumerates the position pairs `(i, j)` with `i < j` in pair-index
    /// order.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> {
        (0..self.seq_len).tuple_combinations()
    }

    /// Maps a position pair `(i, j)` with `i < j` to its pair index.
    ///
    /// # Panics
    ///
    /// Panics unless `i < j < L`.
    #[must_use]
    pub fn pair_index(&self, i: usize, j: usize) -> usize {
        assert!(i < j && j < self.seq_len, "not an ordered pair: ({i}, {j})");

        // pairs with first position < i come first, row-major
        i * self.seq_len - i * (i + 1) / 2 + (j - i - 1)
    }

    /// Maps a pair index back to its position pair.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    #[must_use]
    pub fn pair_at(&self, n: usize) -> (usize, usize) {
        assert!(n < self.num_pairs(), "pair index {n} out of range");

        let mut rest = n;
        for i in 0..self.seq_len - 1 {
            let row = self.seq_len - i - 1;
            if rest < row {
                return (i, i + 1 + rest);
            }
            rest -= row;
        }

        unreachable!();
    }
}
