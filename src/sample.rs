use std::{collections::BTreeMap, sync::OnceLock};

use tracing::debug;

use crate::{
    error::{structure_mismatch, Error, Result},
    logpq::LogPQ,
    math::logsumexp,
    plate::ProgramNode,
    problem::Problem,
    sampling_type::SamplingType,
    scope::Scope,
    tensor::{Dim, NamedTensor},
    tree::Tree,
};

/// Describes a plate that downstream consumers evaluate in chunks.
///
/// The estimate computed by [`Sample`] always covers the whole plate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub plate: String,
    pub chunk_size: usize,
}

/// Particles drawn from `Q` for one [`Problem`].
///
/// The log-densities under `P` and `Q` are computed on first use and cached.
#[derive(Debug)]
pub struct Sample<'a, S: SamplingType> {
    problem: &'a Problem,
    tree: Tree<NamedTensor>,
    groupvarname2kdim: BTreeMap<String, Dim>,
    sampling_type: S,
    reparam: bool,
    split: Option<Split>,
    log_p: OnceLock<Tree<NamedTensor>>,
    log_q: OnceLock<Tree<NamedTensor>>,
}

impl<'a, S: SamplingType> Sample<'a, S> {
    pub(crate) fn new(
        problem: &'a Problem,
        tree: Tree<NamedTensor>,
        groupvarname2kdim: BTreeMap<String, Dim>,
        sampling_type: S,
        reparam: bool,
    ) -> Self {
        Self {
            problem,
            tree,
            groupvarname2kdim,
            sampling_type,
            reparam,
            split: None,
            log_p: OnceLock::new(),
            log_q: OnceLock::new(),
        }
    }

    pub fn with_split(mut self, split: Split) -> Self {
        self.split = Some(split);
        self
    }

    pub fn problem(&self) -> &'a Problem {
        self.problem
    }

    /// The drawn values, arranged like `Q`.
    pub fn tree(&self) -> &Tree<NamedTensor> {
        &self.tree
    }

    pub fn groupvarname2kdim(&self) -> &BTreeMap<String, Dim> {
        &self.groupvarname2kdim
    }

    pub fn sampling_type(&self) -> &S {
        &self.sampling_type
    }

    pub fn reparam(&self) -> bool {
        self.reparam
    }

    pub fn split(&self) -> Option<&Split> {
        self.split.as_ref()
    }

    /// Log-density of the particles and the data under `P`.
    pub fn log_p(&self) -> Result<&Tree<NamedTensor>> {
        if let Some(log_p) = self.log_p.get() {
            return Ok(log_p);
        }
        let merged = self.tree.merge(self.problem.data())?;
        let log_p = self.problem.p().log_prob(
            &merged,
            &Scope::new(),
            &[],
            self.problem.all_platedims(),
            &self.groupvarname2kdim,
        )?;
        Ok(self.log_p.get_or_init(|| log_p))
    }

    /// Log-density of the particles under `Q`, before mixing over parent
    /// particles.
    pub fn log_q(&self) -> Result<&Tree<NamedTensor>> {
        if let Some(log_q) = self.log_q.get() {
            return Ok(log_q);
        }
        let log_q = self.problem.q().log_prob(
            &self.tree,
            &Scope::new(),
            &[],
            self.problem.all_platedims(),
            &self.groupvarname2kdim,
        )?;
        Ok(self.log_q.get_or_init(|| log_q))
    }

    fn reduce(&self, keep: Option<&Dim>) -> Result<NamedTensor> {
        let varname2groupvarname = self.problem.q().plate().varname2groupvarname();
        let parent_groupvarnames = self.problem.groupvarname2parent_groupvarnames();
        let reducer = LogPQ {
            varname2groupvarname: &varname2groupvarname,
            groupvarname2kdim: &self.groupvarname2kdim,
            parent_groupvarnames: &parent_groupvarnames,
            all_platedims: self.problem.all_platedims(),
            sampling_type: &self.sampling_type,
            keep,
        };
        reducer.reduce(self.log_p()?, self.log_q()?)
    }

    /// Importance-sampling estimate of `log P(data)`.
    pub fn log_marginal(&self) -> Result<f64> {
        let result = self.reduce(None)?;
        let Some(value) = result.item() else {
            return structure_mismatch("", "log marginal likelihood has leftover dims");
        };
        debug!(log_marginal = value, "reduced sample");
        Ok(value)
    }

    /// Normalised weights of the particles of a top-level group of `Q`.
    ///
    /// `name` is the group or any of its members. The weight of a particle is
    /// proportional to the estimate obtained with that particle held fixed.
    pub fn importance_weights(&self, name: &str) -> Result<NamedTensor> {
        let varname2groupvarname = self.problem.q().plate().varname2groupvarname();
        let group = varname2groupvarname
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);
        let kdim = self
            .groupvarname2kdim
            .get(group)
            .ok_or_else(|| Error::MissingKdim(name.to_string()))?;
        if !matches!(
            self.problem.q().plate().get(group),
            Some(ProgramNode::Variable(_) | ProgramNode::Group(_))
        ) {
            return structure_mismatch("", format!("`{group}` is not declared at the top level"));
        }

        let log_weights = self.reduce(Some(kdim))?;
        let values = log_weights.iter().collect::<Vec<_>>();
        let norm = logsumexp(&values);
        Ok(log_weights.map(|w| (w - norm).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{distribution::Normal, plate::Plate, sampling_type::Permutation, tensor::AxisArray};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn problem() -> Problem {
        let p = Plate::new()
            .var("z", Normal::new(0., 1.))
            .var("x", Normal::new("z", 1.));
        let q = Plate::new().var("z", Normal::new(0., 1.5));
        Problem::new(p, q, Vec::<(String, usize)>::new(), [("x", AxisArray::scalar(0.3))]).unwrap()
    }

    #[test]
    fn cached_densities() {
        let problem = problem();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let sample = problem.sample(&mut rng, 6, true, Permutation).unwrap();

        let log_p = sample.log_p().unwrap();
        assert!(std::ptr::eq(log_p, sample.log_p().unwrap()));
        assert_eq!(log_p.value("x").unwrap().dims(), &[Dim::k("z", 6)]);
        assert!(sample.log_q().unwrap().value("x").is_none());
        assert!(sample.split().is_none());
        assert!(sample.log_marginal().unwrap().is_finite());
    }

    #[test]
    fn split_does_not_change_the_estimate() {
        let problem = problem();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let sample = problem.sample(&mut rng, 5, false, Permutation).unwrap();
        let whole = sample.log_marginal().unwrap();

        let split = Split {
            plate: "obs".to_string(),
            chunk_size: 2,
        };
        let sample = sample.with_split(split.clone());
        assert_eq!(sample.split(), Some(&split));
        assert_eq!(sample.log_marginal().unwrap(), whole);
    }

    #[test]
    fn importance_weights_sum_to_one() {
        let problem = problem();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let sample = problem.sample(&mut rng, 8, false, Permutation).unwrap();
        let weights = sample.importance_weights("z").unwrap();
        assert_eq!(weights.dims(), &[Dim::k("z", 8)]);
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1., epsilon = 1e-12);

        let err = sample.importance_weights("x").unwrap_err();
        assert!(matches!(err, Error::MissingKdim(name) if name == "x"));
    }
}
