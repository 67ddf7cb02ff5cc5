use thiserror::Error;

use crate::{distribution::DistributionError, tensor::TensorError};

/// Errors raised while building a [`Problem`](crate::Problem) or while
/// sampling and evaluating it.
///
/// All of them point at a defect in the model definition or in the supplied
/// data, so nothing is ever retried.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Names in P differ from the names in Q and the data, or a name is
    /// declared twice.
    #[error("Names do not match between P and Q/data: {}", names.join(", "))]
    NameMismatch { names: Vec<String> },

    #[error("Structure mismatch at `{path}`: {reason}")]
    StructureMismatch { path: String, reason: String },

    #[error("Distribution of `{name}` does not support reparameterised sampling")]
    UnsupportedReparam { name: String },

    /// Inputs, parameters and declared names of a bound plate overlap.
    #[error("Names bound more than once: {}", names.join(", "))]
    NameCollision { names: Vec<String> },

    #[error("Unknown plate `{0}`")]
    UnknownPlate(String),

    #[error("Plate `{plate}` has size {expected}, but an array axis has length {found}")]
    PlateSizeMismatch {
        plate: String,
        expected: usize,
        found: usize,
    },

    #[error("Plate `{0}` must have a positive size")]
    EmptyPlate(String),

    #[error("Number of particles must be positive")]
    InvalidParticleCount,

    #[error("Number of repeats must be positive")]
    InvalidRepeatCount,

    #[error("No K dimension was assigned to `{0}`")]
    MissingKdim(String),

    #[error("Could not evaluate distribution of `{name}` at `{path}`")]
    Distribution {
        name: String,
        path: String,
        #[source]
        source: DistributionError,
    },

    #[error("Tensor operation failed")]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn structure_mismatch<T>(path: &str, reason: impl Into<String>) -> Result<T> {
    Err(Error::StructureMismatch {
        path: display_path(path),
        reason: reason.into(),
    })
}

pub(crate) fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}
