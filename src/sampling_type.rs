//! Strategies for conditioning a group's particles on its parents' particles.
//!
//! Before a group is drawn, the K-dims of the values it reads are replaced
//! by the group's own K-dim: particle `k` of the new group is
//! conditioned on one chosen particle of each parent. The choice is the only
//! thing a strategy decides. Because every strategy here picks each parent
//! particle with marginal probability `1/K`, the proposal density of a
//! particle is the uniform mixture over parent particles, which is what
//! [`SamplingType::reduce_log_q`] computes.

use std::fmt::Debug;

use itertools::Itertools;
use ndarray::{ArrayD, IxDyn};
use rand::{seq::SliceRandom, Rng, RngCore};

use crate::{
    scope::Scope,
    tensor::{Dim, KIndex, NamedTensor, TensorError},
};

pub trait SamplingType: Debug + Clone + Default + Send + Sync + 'static {
    /// Choose, for every particle of `kdim` and every element of the active
    /// plates, a particle of `parent`.
    fn parent_index(
        &self,
        parent: &Dim,
        kdim: &Dim,
        active_platedims: &[Dim],
        rng: &mut dyn RngCore,
    ) -> Result<KIndex, TensorError>;

    /// Replace the K-dims of the values bound to `parents` by `kdim`.
    ///
    /// One index is drawn per parent K-dim and shared by all values carrying
    /// it, so values derived from the same particle stay consistent. Values
    /// not named in `parents` are left as they are.
    fn resample_scope(
        &self,
        scope: &Scope,
        parents: &[String],
        active_platedims: &[Dim],
        kdim: &Dim,
        rng: &mut dyn RngCore,
    ) -> Result<Scope, TensorError> {
        let values = parents
            .iter()
            .unique()
            .filter_map(|name| scope.get(name).map(|value| (name.as_str(), value)))
            .filter(|(_, value)| value.k_dims().any(|dim| dim != kdim))
            .collect_vec();
        let sources = values
            .iter()
            .flat_map(|(_, value)| value.k_dims())
            .filter(|dim| *dim != kdim)
            .unique()
            .sorted()
            .cloned()
            .collect_vec();
        if sources.is_empty() {
            return Ok(scope.clone());
        }

        let indices = sources
            .iter()
            .map(|source| self.parent_index(source, kdim, active_platedims, rng))
            .collect::<Result<Vec<_>, _>>()?;
        let gathered = values
            .into_iter()
            .map(|(name, value)| Ok((name, value.gather(&indices)?)))
            .collect::<Result<Vec<_>, TensorError>>()?;
        Ok(scope.extended(gathered.iter().map(|(name, value)| (*name, value))))
    }

    /// Reduce a proposal log-density evaluated against all parent particles
    /// to the log-density of the mixture proposal, indexed only by `kdim`
    /// and plates.
    fn reduce_log_q(
        &self,
        log_q: &NamedTensor,
        _active_platedims: &[Dim],
        kdim: &Dim,
    ) -> Result<NamedTensor, TensorError> {
        let parents = log_q
            .k_dims()
            .filter(|dim| *dim != kdim)
            .cloned()
            .collect_vec();
        parents
            .iter()
            .try_fold(log_q.clone(), |acc, parent| acc.logmeanexp_dim(parent))
    }
}

fn index_dims(kdim: &Dim, active_platedims: &[Dim]) -> Vec<Dim> {
    std::iter::once(kdim)
        .chain(active_platedims)
        .cloned()
        .collect()
}

/// Every child particle picks each parent particle independently and
/// uniformly at random.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndependentUniform;

impl SamplingType for IndependentUniform {
    fn parent_index(
        &self,
        parent: &Dim,
        kdim: &Dim,
        active_platedims: &[Dim],
        rng: &mut dyn RngCore,
    ) -> Result<KIndex, TensorError> {
        let size = parent.size();
        KIndex::from_fn(
            parent.clone(),
            index_dims(kdim, active_platedims),
            |_| rng.random_range(0..size),
        )
    }
}

/// Child particles are matched to parent particles by a random permutation,
/// drawn independently for every plate element. Every parent particle is
/// used equally often when the K-dims have equal size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Permutation;

impl SamplingType for Permutation {
    fn parent_index(
        &self,
        parent: &Dim,
        kdim: &Dim,
        active_platedims: &[Dim],
        rng: &mut dyn RngCore,
    ) -> Result<KIndex, TensorError> {
        let k = kdim.size();
        let num_elements: usize = active_platedims.iter().map(Dim::size).product();

        // Layout is [kdim, plates...] in row-major order.
        let mut data = vec![0usize; k * num_elements];
        let mut perm = (0..k).map(|i| i % parent.size()).collect_vec();
        for element in 0..num_elements {
            perm.shuffle(&mut *rng);
            for (particle, &index) in perm.iter().enumerate() {
                data[particle * num_elements + element] = index;
            }
        }

        let dims = index_dims(kdim, active_platedims);
        let shape = dims.iter().map(Dim::size).collect_vec();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), data)?;
        KIndex::new(parent.clone(), dims, data)
    }
}
