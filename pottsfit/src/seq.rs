//! Sequence alphabets, device packing and plain-text sample-set I/O.
//!
//! A sequence is `L` letters drawn from `[0, q)`. For device transfer it is
//! zero-padded to `4 * ceil(L / 4)` bytes and transposed, so that byte `i` of
//! walker `k` sits in word `(i / 4, k)` at lane `i % 4`, little-endian. The
//! transposed layout lets the per-site kernels read one word per walker
//! group instead of striding over whole sequences.

use crate::error::{Error, Result};
use crate::geometry::{Geometry, MAX_LETTERS};
use ndarray::{Array2, ArrayView2};
use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;

/// The letters a run's sequences are written in, e.g. `"ABCD"` or a
/// 21-letter protein alphabet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Alphabet {
    letters: Vec<char>,
}

impl Alphabet {
    /// Number of letters `q`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.len()
    }

    /// Always `false`; an alphabet has at least two letters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    /// Encodes a text sequence into letter indices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a character is not in the alphabet.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        text.chars()
            .map(|c| {
                self.letters
                    .iter()
                    .position(|&l| l == c)
                    .map(|i| u8::try_from(i).unwrap_or_else(|_| unreachable!()))
                    .ok_or_else(|| Error::Config(format!("letter '{c}' is not in the alphabet")))
            })
            .collect()
    }

    /// Decodes letter indices back to text.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of range for this alphabet.
    #[must_use]
    pub fn decode(&self, seq: &[u8]) -> String {
        seq.iter().map(|&s| self.letters[usize::from(s)]).collect()
    }
}

impl FromStr for Alphabet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let letters: Vec<char> = s.chars().collect();

        if !(2..=MAX_LETTERS).contains(&letters.len()) {
            return Err(Error::Config(format!(
                "alphabet must have 2..={MAX_LETTERS} letters, got {}",
                letters.len()
            )));
        }
        for (i, c) in letters.iter().enumerate() {
            if letters[..i].contains(c) {
                return Err(Error::Config(format!("duplicate letter '{c}' in alphabet")));
            }
        }

        Ok(Self { letters })
    }
}

impl fmt::Display for Alphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.letters {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Packs unpacked sequences (`nseq x L`, one letter per byte) into the
/// word-transposed device layout (`seq_words x nseq`).
///
/// # Panics
///
/// Panics if the row length does not match the geometry.
#[must_use]
pub fn pack_seqs(geom: &Geometry, seqs: ArrayView2<u8>) -> Array2<u32> {
    assert_eq!(seqs.ncols(), geom.seq_len(), "sequence length mismatch");

    let nseq = seqs.nrows();
    let mut mem = Array2::<u32>::zeros((geom.seq_words(), nseq));

    for (k, seq) in seqs.rows().into_iter().enumerate() {
        for (i, &letter) in seq.iter().enumerate() {
            mem[[i / 4, k]] |= u32::from(letter) << (8 * (i % 4));
        }
    }

    mem
}

/// Unpacks the device layout back into `nseq x L` letter rows.
///
/// # Panics
///
/// Panics if the word count does not match the geometry.
#[must_use]
pub fn unpack_seqs(geom: &Geometry, mem: ArrayView2<u32>) -> Array2<u8> {
    assert_eq!(mem.nrows(), geom.seq_words(), "packed word count mismatch");

    let nseq = mem.ncols();
    Array2::from_shape_fn((nseq, geom.seq_len()), |(k, i)| packed_get(&mem, k, i))
}

/// Reads letter `i` of walker `k` from a packed buffer.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn packed_get(mem: &ArrayView2<u32>, k: usize, i: usize) -> u8 {
    (mem[[i / 4, k]] >> (8 * (i % 4))) as u8
}

/// Writes letter `i` of walker `k` into a packed buffer.
#[inline]
pub fn packed_set(mem: &mut Array2<u32>, k: usize, i: usize, letter: u8) {
    let word = &mut mem[[i / 4, k]];
    *word = (*word & !(0xff << (8 * (i % 4)))) | (u32::from(letter) << (8 * (i % 4)));
}

/// Writes a sample set as one text line per sequence.
///
/// # Errors
///
/// Returns an error when the writer fails.
pub fn write_seqs<W: Write>(
    mut writer: W,
    seqs: ArrayView2<u8>,
    alphabet: &Alphabet,
) -> Result<()> {
    for seq in seqs.rows() {
        let line = alphabet.decode(&seq.to_vec());
        writeln!(writer, "{line}")?;
    }
    Ok(())
}

/// Reads a sample set written by [`write_seqs`].
///
/// # Errors
///
/// Returns [`Error::Config`] when a line has the wrong length or contains a
/// letter outside the alphabet, or an I/O error from the reader.
pub fn read_seqs<R: BufRead>(
    reader: R,
    geom: &Geometry,
    alphabet: &Alphabet,
) -> Result<Array2<u8>> {
    let mut rows = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let seq = alphabet.encode(&line)?;
        if seq.len() != geom.seq_len() {
            return Err(Error::Config(format!(
                "expected sequences of length {}, got {}",
                geom.seq_len(),
                seq.len()
            )));
        }
        rows.extend_from_slice(&seq);
    }

    let nseq = rows.len() / geom.seq_len();
    Array2::from_shape_vec((nseq, geom.seq_len()), rows)
        .map_err(|err| Error::Config(err.to_string()))
}
