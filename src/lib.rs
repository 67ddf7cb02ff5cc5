//! Massively parallel importance sampling for models with nested plates.
//!
//! A model `P` and a proposal `Q` are both written as a [`Plate`]: an ordered
//! list of random variables, groups of jointly drawn variables and nested
//! sub-plates. Drawing from `Q` produces `K` particles per group, each on its
//! own named K-dim, conditioned on resampled particles of the groups before it.
//! The log marginal likelihood estimate then averages over every combination
//! of particles at once by eliminating the K-dims plate by plate.
//!
//! ```ignore
//! use plated_is::{AxisArray, Normal, Plate, Problem, IndependentUniform};
//! use rand::SeedableRng;
//!
//! let p = Plate::new()
//!     .var("mu", Normal::new(0., 1.))
//!     .plate("obs", Plate::new().var("x", Normal::new("mu", 1.)));
//! let q = Plate::new().var("mu", Normal::new(0., 1.));
//! let data = [("x", AxisArray::new(["obs"], ndarray::arr1(&[0.2, -0.1]).into_dyn()))];
//!
//! let problem = Problem::new(p, q, [("obs", 2)], data)?;
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
//! let sample = problem.sample(&mut rng, 100, true, IndependentUniform)?;
//! println!("{}", sample.log_marginal()?);
//! ```

pub(crate) mod bound_plate;
pub(crate) mod checking;
pub(crate) mod distribution;
pub(crate) mod error;
pub(crate) mod estimator;
pub(crate) mod logpq;
pub(crate) mod math;
pub(crate) mod plate;
pub(crate) mod problem;
pub(crate) mod sample;
pub(crate) mod sampling_type;
pub(crate) mod scope;
pub(crate) mod tensor;
pub(crate) mod tree;

pub use bound_plate::BoundPlate;
pub use distribution::{Bernoulli, Distribution, DistributionError, Exponential, Normal, Param};
pub use error::{Error, Result};
pub use estimator::{Estimate, EstimatorSettings, PermutationSettings, UniformSettings};
pub use plate::{Group, Plate, ProgramNode};
pub use problem::Problem;
pub use sample::{Sample, Split};
pub use sampling_type::{IndependentUniform, Permutation, SamplingType};
pub use scope::Scope;
pub use tensor::{AxisArray, Dim, DimKind, KIndex, NamedTensor, PlateDims, TensorError};
pub use tree::Tree;
