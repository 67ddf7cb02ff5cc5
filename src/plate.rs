//! The model tree: plates holding random variables, groups and sub-plates.

use std::collections::{BTreeMap, HashSet};

use itertools::Itertools;
use rand::RngCore;
use tracing::trace;

use crate::{
    distribution::Distribution,
    error::{display_path, structure_mismatch, Error, Result},
    sampling_type::SamplingType,
    scope::Scope,
    tensor::{Dim, NamedTensor, PlateDims},
    tree::{join_path, Tree},
};

/// One declared name in a [`Plate`].
#[derive(Debug)]
pub enum ProgramNode {
    /// A random variable sampled alone; it forms a group of its own.
    Variable(Box<dyn Distribution>),
    /// Variables sampled jointly under one K-dim.
    Group(Group),
    /// A nested plate, replicated over the plate dim of the same name.
    Plate(Plate),
}

/// Random variables that share a K-dim.
///
/// Members are drawn from the scope as it was before the group, so they
/// cannot condition on each other.
#[derive(Debug, Default)]
pub struct Group {
    members: Vec<(String, Box<dyn Distribution>)>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, name: &str, dist: impl Distribution + 'static) -> Self {
        self.members.push((name.to_string(), Box::new(dist)));
        self
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &dyn Distribution)> {
        self.members
            .iter()
            .map(|(name, dist)| (name.as_str(), dist.as_ref()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// An ordered set of declarations, built with the `var`, `group` and `plate`
/// methods.
///
/// ```ignore
/// let model = Plate::new()
///     .var("mu", Normal::new(0., 1.))
///     .plate("obs", Plate::new().var("x", Normal::new("mu", 1.)));
/// ```
#[derive(Debug, Default)]
pub struct Plate {
    items: Vec<(String, ProgramNode)>,
}

fn plate_path(active_platedims: &[Dim]) -> String {
    active_platedims.iter().map(Dim::name).join("/")
}

fn kdim_of<'a>(groupvarname2kdim: &'a BTreeMap<String, Dim>, name: &str) -> Result<&'a Dim> {
    groupvarname2kdim
        .get(name)
        .ok_or_else(|| Error::MissingKdim(name.to_string()))
}

fn platedim_of<'a>(all_platedims: &'a PlateDims, name: &str) -> Result<&'a Dim> {
    all_platedims
        .get(name)
        .ok_or_else(|| Error::UnknownPlate(name.to_string()))
}

fn with_platedim(active_platedims: &[Dim], dim: &Dim) -> Vec<Dim> {
    active_platedims
        .iter()
        .chain(std::iter::once(dim))
        .cloned()
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn draw(
    name: &str,
    dist: &dyn Distribution,
    scope: &Scope,
    active_platedims: &[Dim],
    kdim: &Dim,
    reparam: bool,
    rng: &mut dyn RngCore,
    path: &str,
) -> Result<NamedTensor> {
    if reparam && !dist.has_rsample() {
        return Err(Error::UnsupportedReparam {
            name: join_path(path, name),
        });
    }
    let sample_dims = with_platedim(active_platedims, kdim);
    trace!(name, path, "drawing variable");
    dist.sample(scope, &sample_dims, reparam, rng)
        .map_err(|source| Error::Distribution {
            name: name.to_string(),
            path: display_path(path),
            source,
        })
}

fn evaluate(
    name: &str,
    dist: &dyn Distribution,
    value: &NamedTensor,
    scope: &Scope,
    path: &str,
) -> Result<NamedTensor> {
    dist.log_prob(value, scope)
        .map_err(|source| Error::Distribution {
            name: name.to_string(),
            path: display_path(path),
            source,
        })
}

fn leaf<'a>(sample: &'a Tree<NamedTensor>, name: &str, path: &str) -> Result<&'a NamedTensor> {
    match sample.value(name) {
        Some(value) => Ok(value),
        None => structure_mismatch(path, format!("no value for `{name}`")),
    }
}

impl Plate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, name: &str, dist: impl Distribution + 'static) -> Self {
        self.items
            .push((name.to_string(), ProgramNode::Variable(Box::new(dist))));
        self
    }

    pub fn group(mut self, name: &str, group: Group) -> Self {
        self.items.push((name.to_string(), ProgramNode::Group(group)));
        self
    }

    pub fn plate(mut self, name: &str, plate: Plate) -> Self {
        self.items.push((name.to_string(), ProgramNode::Plate(plate)));
        self
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &ProgramNode)> {
        self.items.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn get(&self, name: &str) -> Option<&ProgramNode> {
        self.items
            .iter()
            .find(|(item, _)| item == name)
            .map(|(_, node)| node)
    }

    fn for_each_node<'a, F: FnMut(&'a str, &'a ProgramNode)>(&'a self, f: &mut F) {
        for (name, node) in self.items.iter() {
            f(name, node);
            if let ProgramNode::Plate(inner) = node {
                inner.for_each_node(f);
            }
        }
    }

    /// Whether `name` is a variable or group member declared directly in this
    /// plate.
    fn declares_variable(&self, name: &str) -> bool {
        self.items.iter().any(|(item, node)| match node {
            ProgramNode::Variable(_) => item == name,
            ProgramNode::Group(group) => group.names().any(|member| member == name),
            ProgramNode::Plate(_) => false,
        })
    }

    /// Names of all random variables, group members included, at any depth.
    pub fn all_prog_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each_node(&mut |name, node| match node {
            ProgramNode::Variable(_) => names.push(name.to_string()),
            ProgramNode::Group(group) => names.extend(group.names().map(str::to_string)),
            ProgramNode::Plate(_) => {}
        });
        names
    }

    /// Every declared name: variables, group members, groups and plates.
    pub fn all_declared_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each_node(&mut |name, node| {
            names.push(name.to_string());
            if let ProgramNode::Group(group) = node {
                names.extend(group.names().map(str::to_string));
            }
        });
        names
    }

    /// Names of groups and of variables that are not in a group.
    pub fn groupvarnames(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each_node(&mut |name, node| match node {
            ProgramNode::Variable(_) | ProgramNode::Group(_) => names.push(name.to_string()),
            ProgramNode::Plate(_) => {}
        });
        names
    }

    pub fn varname2groupvarname(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        self.for_each_node(&mut |name, node| match node {
            ProgramNode::Variable(_) => {
                map.insert(name.to_string(), name.to_string());
            }
            ProgramNode::Group(group) => {
                for member in group.names() {
                    map.insert(member.to_string(), name.to_string());
                }
            }
            ProgramNode::Plate(_) => {}
        });
        map
    }

    /// Scope names each group or ungrouped variable reads, excluding the
    /// group's own members. Names of data, inputs and parameters are kept.
    pub fn groupvarname2parents(&self) -> BTreeMap<String, Vec<String>> {
        let mut map = BTreeMap::new();
        self.for_each_node(&mut |name, node| match node {
            ProgramNode::Variable(dist) => {
                map.insert(name.to_string(), dist.parents());
            }
            ProgramNode::Group(group) => {
                let members: HashSet<&str> = group.names().collect();
                let parents = group
                    .members()
                    .flat_map(|(_, dist)| dist.parents())
                    .filter(|parent| !members.contains(parent.as_str()))
                    .unique()
                    .collect();
                map.insert(name.to_string(), parents);
            }
            ProgramNode::Plate(_) => {}
        });
        map
    }

    /// A fresh K-dim of extent `k` for every group and ungrouped variable.
    pub fn groupvarname2kdim(&self, k: usize) -> BTreeMap<String, Dim> {
        self.groupvarnames()
            .into_iter()
            .map(|name| {
                let dim = Dim::k(&name, k);
                (name, dim)
            })
            .collect()
    }

    /// Draw every variable of this plate and its sub-plates.
    ///
    /// A variable is drawn with dims `active_platedims + [kdim]`, from a scope
    /// in which the values it reads have been resampled onto its group's
    /// K-dim. Each draw is
    /// added to the scope seen by later declarations at this level and below.
    #[allow(clippy::too_many_arguments)]
    pub fn sample<S: SamplingType>(
        &self,
        scope: &Scope,
        active_platedims: &[Dim],
        all_platedims: &PlateDims,
        sampling_type: &S,
        groupvarname2kdim: &BTreeMap<String, Dim>,
        reparam: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Tree<NamedTensor>> {
        let path = plate_path(active_platedims);
        let mut scope = scope.clone();
        let mut tree = Tree::new();

        for (name, node) in self.items() {
            match node {
                ProgramNode::Variable(dist) => {
                    let kdim = kdim_of(groupvarname2kdim, name)?;
                    let resampled = sampling_type.resample_scope(
                        &scope,
                        &dist.parents(),
                        active_platedims,
                        kdim,
                        rng,
                    )?;
                    let value = draw(
                        name,
                        dist.as_ref(),
                        &resampled,
                        active_platedims,
                        kdim,
                        reparam,
                        rng,
                        &path,
                    )?;
                    scope = scope.with(name, value.clone());
                    tree.insert_value(name, value);
                }
                ProgramNode::Group(group) => {
                    let kdim = kdim_of(groupvarname2kdim, name)?;
                    let parents = group
                        .members()
                        .flat_map(|(_, dist)| dist.parents())
                        .collect_vec();
                    let resampled = sampling_type.resample_scope(
                        &scope,
                        &parents,
                        active_platedims,
                        kdim,
                        rng,
                    )?;
                    let mut draws = Vec::with_capacity(group.len());
                    for (member, dist) in group.members() {
                        let value = draw(
                            member,
                            dist,
                            &resampled,
                            active_platedims,
                            kdim,
                            reparam,
                            rng,
                            &path,
                        )?;
                        draws.push((member, value));
                    }
                    for (member, value) in draws {
                        scope = scope.with(member, value.clone());
                        tree.insert_value(member, value);
                    }
                }
                ProgramNode::Plate(inner) => {
                    let dim = platedim_of(all_platedims, name)?;
                    let active = with_platedim(active_platedims, dim);
                    let sub = inner.sample(
                        &scope,
                        &active,
                        all_platedims,
                        sampling_type,
                        groupvarname2kdim,
                        reparam,
                        rng,
                    )?;
                    tree.insert_plate(name, sub);
                }
            }
        }
        Ok(tree)
    }

    /// Log-density of every leaf of `sample` under this plate's distributions.
    ///
    /// Each result keeps the K-dims of the leaf and of everything it was
    /// conditioned on; nothing is reduced here. Latent leaves must carry the
    /// K-dim assigned to their group.
    pub fn log_prob(
        &self,
        sample: &Tree<NamedTensor>,
        scope: &Scope,
        active_platedims: &[Dim],
        all_platedims: &PlateDims,
        groupvarname2kdim: &BTreeMap<String, Dim>,
    ) -> Result<Tree<NamedTensor>> {
        let path = plate_path(active_platedims);
        self.check_sample_names(sample, &path)?;

        let check_kdim = |groupvarname: &str, name: &str, value: &NamedTensor| -> Result<()> {
            match groupvarname2kdim.get(groupvarname) {
                Some(kdim) if !value.has_dim(kdim) => structure_mismatch(
                    &path,
                    format!("value of `{name}` is not indexed by {kdim}"),
                ),
                _ => Ok(()),
            }
        };

        let mut scope = scope.clone();
        let mut tree = Tree::new();
        for (name, node) in self.items() {
            match node {
                ProgramNode::Variable(dist) => {
                    let value = leaf(sample, name, &path)?;
                    check_kdim(name, name, value)?;
                    let log_prob = evaluate(name, dist.as_ref(), value, &scope, &path)?;
                    scope = scope.with(name, value.clone());
                    tree.insert_value(name, log_prob);
                }
                ProgramNode::Group(group) => {
                    let group_scope = scope.clone();
                    for (member, dist) in group.members() {
                        let value = leaf(sample, member, &path)?;
                        check_kdim(name, member, value)?;
                        let log_prob = evaluate(member, dist, value, &group_scope, &path)?;
                        scope = scope.with(member, value.clone());
                        tree.insert_value(member, log_prob);
                    }
                }
                ProgramNode::Plate(inner) => {
                    let dim = platedim_of(all_platedims, name)?;
                    let active = with_platedim(active_platedims, dim);
                    let empty = Tree::new();
                    let sub_sample = sample.plate(name).unwrap_or(&empty);
                    let sub = inner.log_prob(
                        sub_sample,
                        &scope,
                        &active,
                        all_platedims,
                        groupvarname2kdim,
                    )?;
                    tree.insert_plate(name, sub);
                }
            }
        }
        trace!(path, "evaluated log densities");
        Ok(tree)
    }

    fn check_sample_names(&self, sample: &Tree<NamedTensor>, path: &str) -> Result<()> {
        for (name, _) in sample.values() {
            if !self.declares_variable(name) {
                return structure_mismatch(path, format!("`{name}` is not declared here"));
            }
        }
        for (name, _) in sample.plates() {
            if !matches!(self.get(name), Some(ProgramNode::Plate(_))) {
                return structure_mismatch(path, format!("plate `{name}` is not declared here"));
            }
        }
        Ok(())
    }
}
