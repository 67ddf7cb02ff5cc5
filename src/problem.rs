use std::collections::{BTreeMap, HashMap, HashSet};

use itertools::Itertools;
use rand::Rng;
use tracing::debug;

use crate::{
    bound_plate::BoundPlate,
    checking::{check_structure, check_unique, mismatch_names},
    error::{Error, Result},
    sample::Sample,
    sampling_type::SamplingType,
    scope::Scope,
    tensor::{AxisArray, Dim, NamedTensor, PlateDims},
    tree::{undeclared, Tree},
};

/// A generative model `P`, a proposal `Q` over its latent variables, the
/// plate sizes and the observed data.
///
/// Construction checks that `Q` and the data together supply every variable
/// of `P` exactly once, at the position `P` declares it.
#[derive(Debug)]
pub struct Problem {
    p: BoundPlate,
    q: BoundPlate,
    all_platedims: PlateDims,
    data: Tree<NamedTensor>,
}

impl Problem {
    pub fn new<S, T>(
        p: impl Into<BoundPlate>,
        q: impl Into<BoundPlate>,
        all_platesizes: impl IntoIterator<Item = (S, usize)>,
        data: impl IntoIterator<Item = (T, AxisArray)>,
    ) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let p = p.into();
        let q = q.into();

        let mut all_platedims = PlateDims::new();
        for (name, size) in all_platesizes {
            let name = name.into();
            if size == 0 {
                return Err(Error::EmptyPlate(name));
            }
            let dim = Dim::plate(&name, size);
            all_platedims.insert(name, dim);
        }

        let data = data
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect_vec();
        let data_names = data.iter().map(|(name, _)| name.clone()).collect_vec();

        check_unique(&p.plate().all_declared_names())?;
        check_unique(
            &q.plate()
                .all_declared_names()
                .into_iter()
                .chain(data_names.iter().cloned())
                .collect_vec(),
        )?;
        let qdata_names = q
            .plate()
            .all_prog_names()
            .into_iter()
            .chain(data_names.iter().cloned())
            .collect_vec();
        mismatch_names(&p.plate().all_prog_names(), &qdata_names)?;

        let mut named = data
            .iter()
            .map(|(name, value)| Ok((name.clone(), value.to_named(&all_platedims)?)))
            .collect::<Result<HashMap<String, NamedTensor>>>()?;
        let data = Tree::from_declarations(p.plate(), &mut named, "")?;
        if !named.is_empty() {
            return Err(undeclared(&named));
        }
        check_structure("", p.plate(), q.plate(), &data)?;

        debug!(
            plates = all_platedims.len(),
            observed = data_names.len(),
            "built problem"
        );
        Ok(Self {
            p,
            q,
            all_platedims,
            data,
        })
    }

    pub fn p(&self) -> &BoundPlate {
        &self.p
    }

    pub fn q(&self) -> &BoundPlate {
        &self.q
    }

    pub fn all_platedims(&self) -> &PlateDims {
        &self.all_platedims
    }

    /// Observed data, arranged like `P`.
    pub fn data(&self) -> &Tree<NamedTensor> {
        &self.data
    }

    /// Draw `k` particles for every latent group of `Q`.
    pub fn sample<S: SamplingType, R: Rng>(
        &self,
        rng: &mut R,
        k: usize,
        reparam: bool,
        sampling_type: S,
    ) -> Result<Sample<'_, S>> {
        if k == 0 {
            return Err(Error::InvalidParticleCount);
        }
        let groupvarname2kdim = self.q.plate().groupvarname2kdim(k);
        debug!(k, reparam, ?sampling_type, "sampling proposal");

        let tree = self.q.sample(
            &Scope::new(),
            &[],
            &self.all_platedims,
            &sampling_type,
            &groupvarname2kdim,
            reparam,
            rng,
        )?;
        Ok(Sample::new(
            self,
            tree,
            groupvarname2kdim,
            sampling_type,
            reparam,
        ))
    }

    /// For every group of `Q`, the other groups of `Q` its distribution in
    /// `P` reads. Dependencies on data, inputs and parameters are dropped.
    pub fn groupvarname2parent_groupvarnames(&self) -> BTreeMap<String, Vec<String>> {
        let varname2groupvarname = self.q.plate().varname2groupvarname();
        let q_groups: HashSet<String> = self.q.plate().groupvarnames().into_iter().collect();

        self.p
            .plate()
            .groupvarname2parents()
            .into_iter()
            .filter(|(groupvarname, _)| q_groups.contains(groupvarname))
            .map(|(groupvarname, parents)| {
                let parents = parents
                    .iter()
                    .filter_map(|parent| varname2groupvarname.get(parent))
                    .unique()
                    .cloned()
                    .collect();
                (groupvarname, parents)
            })
            .collect()
    }
}
