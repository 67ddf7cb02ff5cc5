//! Reduction of per-variable log-densities to the log marginal likelihood
//! estimate.
//!
//! Every latent group contributes a factor `log P - log Q` over its K-dim and
//! the K-dims of its parents. The estimate averages the product of all
//! factors over every combination of particle indices, which is computed by
//! variable elimination: sub-plates are reduced first and summed over their
//! plate dim, then the K-dims declared at the current level are averaged out
//! one at a time, children before parents.

use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    error::{structure_mismatch, Error, Result},
    sampling_type::SamplingType,
    tensor::{Dim, NamedTensor, PlateDims},
    tree::{join_path, Tree},
};

pub(crate) struct LogPQ<'a, S> {
    pub varname2groupvarname: &'a BTreeMap<String, String>,
    pub groupvarname2kdim: &'a BTreeMap<String, Dim>,
    pub parent_groupvarnames: &'a BTreeMap<String, Vec<String>>,
    pub all_platedims: &'a PlateDims,
    pub sampling_type: &'a S,
    /// A top-level K-dim left in the result instead of being averaged out.
    pub keep: Option<&'a Dim>,
}

impl<S: SamplingType> LogPQ<'_, S> {
    /// Reduce `log_p` (latent and observed leaves) and `log_q` (latent
    /// leaves) to a tensor with no dims, or only the kept K-dim.
    pub(crate) fn reduce(
        &self,
        log_p: &Tree<NamedTensor>,
        log_q: &Tree<NamedTensor>,
    ) -> Result<NamedTensor> {
        self.reduce_plate("", log_p, log_q, &[])
    }

    fn reduce_plate(
        &self,
        path: &str,
        log_p: &Tree<NamedTensor>,
        log_q: &Tree<NamedTensor>,
        active_platedims: &[Dim],
    ) -> Result<NamedTensor> {
        let mut groups: BTreeMap<&str, (Vec<&NamedTensor>, Vec<&NamedTensor>)> = BTreeMap::new();
        for (name, lq) in log_q.values() {
            let Some(lp) = log_p.value(name) else {
                return structure_mismatch(path, format!("no log P for `{name}`"));
            };
            let group = self
                .varname2groupvarname
                .get(name)
                .ok_or_else(|| Error::MissingKdim(name.to_string()))?;
            let entry = groups.entry(group.as_str()).or_default();
            entry.0.push(lp);
            entry.1.push(lq);
        }

        // Observed leaves enter as they are.
        let mut factors = log_p
            .values()
            .filter(|(name, _)| log_q.value(name).is_none())
            .map(|(_, lp)| lp.clone())
            .collect::<Vec<_>>();

        let mut local = Vec::with_capacity(groups.len());
        for (group, (lps, lqs)) in groups {
            let kdim = self
                .groupvarname2kdim
                .get(group)
                .ok_or_else(|| Error::MissingKdim(group.to_string()))?;
            let lq = NamedTensor::sum_tensors(lqs)?;
            let lq = self.sampling_type.reduce_log_q(&lq, active_platedims, kdim)?;
            let lp = NamedTensor::sum_tensors(lps)?;
            factors.push(lp.sub_tensor(&lq)?);
            local.push((group, kdim));
        }

        let empty = Tree::new();
        for (name, sub_log_p) in log_p.plates() {
            let dim = self
                .all_platedims
                .get(name)
                .ok_or_else(|| Error::UnknownPlate(name.to_string()))?;
            let active = active_platedims
                .iter()
                .chain(std::iter::once(dim))
                .cloned()
                .collect::<Vec<_>>();
            let sub_log_q = log_q.plate(name).unwrap_or(&empty);
            let sub = self.reduce_plate(&join_path(path, name), sub_log_p, sub_log_q, &active)?;
            factors.push(sub.sum_plate(dim)?);
        }

        self.eliminate(path, local, factors)
    }

    fn eliminate(
        &self,
        path: &str,
        mut local: Vec<(&str, &Dim)>,
        mut factors: Vec<NamedTensor>,
    ) -> Result<NamedTensor> {
        if let Some(keep) = self.keep {
            local.retain(|(_, kdim)| *kdim != keep);
        }

        while !local.is_empty() {
            // The last group that no remaining group depends on.
            let position = local
                .iter()
                .rposition(|(group, _)| {
                    !local.iter().any(|(other, _)| {
                        self.parent_groupvarnames
                            .get(*other)
                            .is_some_and(|parents| parents.iter().any(|parent| parent == group))
                    })
                })
                .unwrap_or(local.len() - 1);
            let (group, kdim) = local.remove(position);
            trace!(path, group, %kdim, "eliminating K dim");

            let (touching, rest): (Vec<_>, Vec<_>) =
                factors.into_iter().partition(|factor| factor.has_dim(kdim));
            let combined = NamedTensor::sum_tensors(&touching)?.logmeanexp_dim(kdim)?;
            factors = rest;
            factors.push(combined);
        }

        Ok(NamedTensor::sum_tensors(&factors)?)
    }
}
