use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use pottsfit::geometry::Geometry;
use pottsfit::run::{CouplingInit, logscore_couplings};
use pottsfit::seq::Alphabet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub fn read_pair_tensor(input: &Path) -> Result<Array2<f32>> {
    Array2::<f32>::read_npy(
        File::open(input).context(format!("unable to open '{}'", input.display()))?,
    )
    .context(format!("unable to read '{}'", input.display()))
}

pub fn write_pair_tensor(output: &Path, tensor: &Array2<f32>) -> Result<()> {
    tensor
        .write_npy(BufWriter::new(File::create(output).context(format!(
            "unable to write '{}'",
            output.display()
        ))?))
        .context(format!("unable to write '{}'", output.display()))
}

pub fn geometry_of(tensor: &Array2<f32>) -> Result<Geometry> {
    Ok(Geometry::from_tensor_shape(tensor.nrows(), tensor.ncols())?)
}

pub fn parse_alphabet(alpha: &str, geom: &Geometry) -> Result<Alphabet> {
    let alphabet: Alphabet = alpha.parse()?;
    if alphabet.len() != geom.num_letters() {
        return Err(anyhow!(
            "expected alphabet of size {}, got {}",
            geom.num_letters(),
            alphabet.len()
        ));
    }
    Ok(alphabet)
}

/// Adds a pseudocount to the target marginals and renormalizes each row.
pub fn apply_pseudocount(mut bimarg: Array2<f32>, pc: f32) -> Array2<f32> {
    if pc == 0.0 {
        return bimarg;
    }

    bimarg.mapv_inplace(|x| x + pc);
    for mut row in bimarg.rows_mut() {
        let total: f32 = row.sum();
        row.mapv_inplace(|x| x / total);
    }
    bimarg
}

/// Resolves the `--couplings` argument: `zero`, `logscore`, or a `.npy`
/// path.
pub fn coupling_init(spec: &str, geom: &Geometry) -> Result<CouplingInit> {
    match spec {
        "zero" => Ok(CouplingInit::Zero),
        "logscore" => Ok(CouplingInit::IndependentLogOdds),
        path => {
            let couplings = read_pair_tensor(Path::new(path))?;
            if couplings.dim() != (geom.num_pairs(), geom.num_states()) {
                return Err(anyhow!(
                    "couplings in '{spec}' do not match the target geometry"
                ));
            }
            Ok(CouplingInit::Given(couplings))
        }
    }
}

/// Materializes initial couplings outside of [`pottsfit::run::Inference`],
/// for the subcommands that drive devices directly.
pub fn resolve_couplings(
    init: &CouplingInit,
    geom: &Geometry,
    bimarg_target: &Array2<f32>,
) -> Array2<f32> {
    match init {
        CouplingInit::Zero => Array2::zeros((geom.num_pairs(), geom.num_states())),
        CouplingInit::IndependentLogOdds => logscore_couplings(geom, bimarg_target.view()),
        CouplingInit::Given(j) => j.clone(),
    }
}

/// Parses a comma-separated inverse-temperature ladder.
pub fn parse_ladder(spec: &str) -> Result<Vec<f32>> {
    spec.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .context(format!("bad temperature '{part}' in ladder"))
        })
        .collect()
}

/// Parses the `--regularize` argument `fn_lmbda,fn_s`.
pub fn parse_regularization(spec: &str) -> Result<pottsfit::config::Regularization> {
    let (lmbda, s) = spec
        .split_once(',')
        .ok_or_else(|| anyhow!("regularization must be given as 'fn_lmbda,fn_s'"))?;
    Ok(pottsfit::config::Regularization {
        fn_lmbda: lmbda.trim().parse().context("bad fn_lmbda")?,
        fn_s: s.trim().parse().context("bad fn_s")?,
    })
}
