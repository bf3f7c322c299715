//! Persisted state of a run.
//!
//! Every macro-iteration leaves a `run_i/` directory with the couplings,
//! marginals, histogram, energies, sampled sequences and a one-line summary;
//! pre-optimization and equilibration tracking write alongside. Tensors are
//! `.npy` files, histograms and sequences plain text.

use crate::error::Result;
use crate::observables::FitStats;
use crate::seq::{self, Alphabet};
use ndarray::{Array2, ArrayView1, ArrayView2};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A short preview of a tensor's tail for the run summary.
fn tail_preview<T: Display + Copy>(values: impl Iterator<Item = T>) -> String {
    let all: Vec<T> = values.collect();
    let tail = &all[all.len().saturating_sub(5)..];
    tail.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything one macro-iteration checkpoint contains.
pub struct MacroRecord<'a> {
    /// Seed sequence this iteration sampled from.
    pub startseq: &'a [u8],
    /// Run alphabet, for the text outputs.
    pub alphabet: &'a Alphabet,
    /// Summary statistics versus the target.
    pub stats: FitStats,
    /// Couplings the iteration sampled under.
    pub couplings: ArrayView2<'a, f32>,
    /// Pooled marginals of the sample set.
    pub bimarg: ArrayView2<'a, f32>,
    /// Pooled pair histogram.
    pub bicount: ArrayView2<'a, u32>,
    /// Sampled energies, concatenated.
    pub energies: ArrayView1<'a, f32>,
    /// Sampled sequences, one array per device.
    pub seqs: &'a [Array2<u8>],
    /// Tempering swap rate, when tempering ran.
    pub swap_rate: Option<f32>,
}

/// Writes run state under one output directory.
#[derive(Debug)]
pub struct RunWriter {
    root: PathBuf,
}

impl RunWriter {
    /// Creates the output directory (and parents) if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The output directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_npy_f32(path: &Path, tensor: ArrayView2<'_, f32>) -> Result<()> {
        tensor.write_npy(BufWriter::new(File::create(path)?))?;
        Ok(())
    }

    /// Dumps the canonicalized initial couplings as `startJ.npy`.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_start_couplings(&self, couplings: ArrayView2<'_, f32>) -> Result<()> {
        Self::write_npy_f32(&self.root.join("startJ.npy"), couplings)
    }

    /// Writes the complete checkpoint of one macro-iteration into
    /// `<root>/<name>/`.
    ///
    /// # Errors
    ///
    /// Returns an error when any file cannot be written.
    pub fn write_macro(&self, name: &str, record: &MacroRecord<'_>) -> Result<()> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;

        Self::write_npy_f32(&dir.join("J.npy"), record.couplings)?;
        Self::write_npy_f32(&dir.join("bimarg.npy"), record.bimarg)?;
        record
            .energies
            .write_npy(BufWriter::new(File::create(dir.join("energies.npy"))?))?;

        let mut bicounts = BufWriter::new(File::create(dir.join("bicounts"))?);
        for row in record.bicount.rows() {
            let line = row
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(bicounts, "{line}")?;
        }

        let mut startseq = File::create(dir.join("startseq"))?;
        writeln!(startseq, "{}", record.alphabet.decode(record.startseq))?;

        for (k, seqs) in record.seqs.iter().enumerate() {
            let file = BufWriter::new(File::create(dir.join(format!("seqs-{k}")))?);
            seq::write_seqs(file, seqs.view(), record.alphabet)?;
        }

        let mut info = File::create(dir.join("info.txt"))?;
        write!(info, "{}", Self::summary(name, record))?;

        Ok(())
    }

    /// The one-line-per-item summary of a macro-iteration, as written to
    /// `info.txt`.
    #[must_use]
    pub fn summary(name: &str, record: &MacroRecord<'_>) -> String {
        let lowest = record
            .energies
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min);
        let mean: f64 = record.energies.iter().map(|&e| f64::from(e)).sum::<f64>()
            / record.energies.len().max(1) as f64;

        let mut lines = vec![
            format!("Start Seq: {}", record.alphabet.decode(record.startseq)),
            format!(
                "{name} Ferr: {:9.7}  SSR: {:9.5}  wDf: {:9.5}",
                record.stats.ferr, record.stats.ssr, record.stats.wdf
            ),
            format!("Bicounts: {} ...", tail_preview(record.bicount.iter().copied())),
            format!("Marginals: {} ...", tail_preview(record.bimarg.iter().copied())),
            format!("Couplings: {} ...", tail_preview(record.couplings.iter().copied())),
            format!("Energies: Lowest = {lowest}, Mean = {mean}"),
        ];
        if let Some(rate) = record.swap_rate {
            lines.push(format!("PT swap rate: {:.2}%", rate * 100.0));
        }

        lines.join("\n") + "\n"
    }

    /// Writes one equilibration-tracking snapshot as
    /// `<name>/equilibration/bimarg_<tick>.npy`.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_tracked(
        &self,
        name: &str,
        tick: usize,
        bimarg: ArrayView2<'_, f32>,
    ) -> Result<()> {
        let dir = self.root.join(name).join("equilibration");
        std::fs::create_dir_all(&dir)?;
        Self::write_npy_f32(&dir.join(format!("bimarg_{tick}.npy")), bimarg)
    }

    /// Writes the post-Newton marginal prediction of a macro-iteration.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_predicted(&self, name: &str, bimarg: ArrayView2<'_, f32>) -> Result<()> {
        Self::write_npy_f32(&self.root.join(name).join("predictedBimarg.npy"), bimarg)
    }

    /// Writes the initial state of a pre-optimization: the population's
    /// unweighted statistics and the couplings it was scored under.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_preopt_init(
        &self,
        couplings: ArrayView2<'_, f32>,
        bimarg: ArrayView2<'_, f32>,
        bicount: ArrayView2<'_, u32>,
        seqs: &[Array2<u8>],
        alphabet: &Alphabet,
    ) -> Result<()> {
        let dir = self.root.join("preopt");
        std::fs::create_dir_all(&dir)?;

        Self::write_npy_f32(&dir.join("initJ.npy"), couplings)?;
        Self::write_npy_f32(&dir.join("initbimarg.npy"), bimarg)?;
        bicount.write_npy(BufWriter::new(File::create(dir.join("initBicount.npy"))?))?;
        for (k, seqs) in seqs.iter().enumerate() {
            let file = BufWriter::new(File::create(dir.join(format!("seqs-{k}")))?);
            seq::write_seqs(file, seqs.view(), alphabet)?;
        }
        Ok(())
    }

    /// Writes the refined couplings and predicted marginals of a
    /// pre-optimization.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_preopt_result(
        &self,
        couplings: ArrayView2<'_, f32>,
        bimarg: ArrayView2<'_, f32>,
    ) -> Result<()> {
        let dir = self.root.join("preopt");
        std::fs::create_dir_all(&dir)?;
        Self::write_npy_f32(&dir.join("perturbedJ.npy"), couplings)?;
        Self::write_npy_f32(&dir.join("perturbedbimarg.npy"), bimarg)
    }
}

/// Reads a `P x q^2` `f32` tensor (couplings or marginals) from a `.npy`
/// file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or has the wrong dtype or
/// rank.
pub fn read_pair_tensor(path: &Path) -> Result<Array2<f32>> {
    Ok(Array2::<f32>::read_npy(File::open(path)?)?)
}

/// Reads the start sequence of a run directory.
///
/// # Errors
///
/// Returns an error when the file cannot be read or contains letters
/// outside the alphabet.
pub fn read_startseq(path: &Path, alphabet: &Alphabet) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    alphabet.encode(text.trim())
}

#[cfg(test)]
mod tests {
    use super::{read_pair_tensor, read_startseq, MacroRecord, RunWriter};
    use crate::observables::FitStats;
    use crate::seq::Alphabet;
    use ndarray::{array, Array1, Array2};

    #[test]
    fn macro_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::new(dir.path()).unwrap();
        let alphabet: Alphabet = "AB".parse().unwrap();

        let couplings = array![[0.5_f32, -0.5, 0.25, 0.0]];
        let bimarg = array![[0.25_f32, 0.25, 0.25, 0.25]];
        let bicount = array![[4_u32, 4, 4, 4]];
        let energies = Array1::from(vec![-1.0_f32, 0.5]);
        let seqs = vec![array![[0_u8, 1], [1, 0]]];

        let record = MacroRecord {
            startseq: &[0, 1],
            alphabet: &alphabet,
            stats: FitStats {
                ferr: 0.1,
                ssr: 0.01,
                wdf: 0.05,
            },
            couplings: couplings.view(),
            bimarg: bimarg.view(),
            bicount: bicount.view(),
            energies: energies.view(),
            seqs: &seqs,
            swap_rate: Some(0.25),
        };
        writer.write_macro("run_0", &record).unwrap();

        let run = dir.path().join("run_0");
        let j: Array2<f32> = read_pair_tensor(&run.join("J.npy")).unwrap();
        assert_eq!(j, couplings);
        assert_eq!(read_startseq(&run.join("startseq"), &alphabet).unwrap(), [0, 1]);

        let info = std::fs::read_to_string(run.join("info.txt")).unwrap();
        assert!(info.contains("Start Seq: AB"));
        assert!(info.contains("PT swap rate: 25.00%"));

        let bicounts = std::fs::read_to_string(run.join("bicounts")).unwrap();
        assert_eq!(bicounts.lines().next().unwrap(), "4 4 4 4");

        let seqs_text = std::fs::read_to_string(run.join("seqs-0")).unwrap();
        assert_eq!(seqs_text, "AB\nBA\n");
    }

    #[test]
    fn tracked_snapshots_land_in_equilibration_dir() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::new(dir.path()).unwrap();
        let bimarg = array![[0.5_f32, 0.0, 0.0, 0.5]];

        writer.write_tracked("run_1", 3, bimarg.view()).unwrap();
        let path = dir
            .path()
            .join("run_1")
            .join("equilibration")
            .join("bimarg_3.npy");
        assert_eq!(read_pair_tensor(&path).unwrap(), bimarg);
    }
}
