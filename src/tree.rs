use std::collections::{BTreeMap, HashMap};

use crate::{
    error::{structure_mismatch, Error, Result},
    plate::{Plate, ProgramNode},
    tensor::NamedTensor,
};

/// Values arranged like the plate that produced them: leaves by variable
/// name, nested plates by plate name.
///
/// Used for samples, observed data and per-variable log-densities.
#[derive(Clone, Debug)]
pub struct Tree<T> {
    values: BTreeMap<String, T>,
    plates: BTreeMap<String, Tree<T>>,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            plates: BTreeMap::new(),
        }
    }
}

pub(crate) fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    }
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> Option<&T> {
        self.values.get(name)
    }

    pub fn plate(&self, name: &str) -> Option<&Tree<T>> {
        self.plates.get(name)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &T)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn plates(&self) -> impl Iterator<Item = (&str, &Tree<T>)> {
        self.plates.iter().map(|(name, tree)| (name.as_str(), tree))
    }

    pub fn insert_value(&mut self, name: &str, value: T) {
        self.values.insert(name.to_string(), value);
    }

    pub fn insert_plate(&mut self, name: &str, tree: Tree<T>) {
        self.plates.insert(name.to_string(), tree);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.plates.values().all(Tree::is_empty)
    }

    /// Every leaf together with the path of plate names leading to it.
    pub fn flatten(&self) -> Vec<(String, &str, &T)> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a str, &'a T)>) {
        for (name, value) in self.values.iter() {
            out.push((path.to_string(), name.as_str(), value));
        }
        for (name, tree) in self.plates.iter() {
            tree.flatten_into(&join_path(path, name), out);
        }
    }
}

impl<T: Clone> Tree<T> {
    /// Union of two trees over disjoint leaves.
    pub fn merge(&self, other: &Tree<T>) -> Result<Tree<T>> {
        self.merge_at("", other)
    }

    fn merge_at(&self, path: &str, other: &Tree<T>) -> Result<Tree<T>> {
        let mut merged = self.clone();
        for (name, value) in other.values.iter() {
            if merged.values.contains_key(name) {
                return structure_mismatch(path, format!("`{name}` is present in both trees"));
            }
            merged.values.insert(name.clone(), value.clone());
        }
        for (name, tree) in other.plates.iter() {
            let sub = match self.plates.get(name) {
                Some(mine) => mine.merge_at(&join_path(path, name), tree)?,
                None => tree.clone(),
            };
            merged.plates.insert(name.clone(), sub);
        }
        Ok(merged)
    }
}

impl Tree<NamedTensor> {
    /// Place flat, named data into the position each name is declared at in
    /// `plate`.
    pub(crate) fn from_declarations(
        plate: &Plate,
        data: &mut HashMap<String, NamedTensor>,
        path: &str,
    ) -> Result<Self> {
        let mut tree = Tree::new();
        for (name, node) in plate.items() {
            match node {
                ProgramNode::Variable(_) => {
                    if let Some(value) = data.remove(name) {
                        tree.insert_value(name, value);
                    }
                }
                ProgramNode::Group(group) => {
                    if let Some(member) = group.names().find(|member| data.contains_key(*member)) {
                        return structure_mismatch(
                            path,
                            format!(
                                "`{member}` is a member of group `{name}` and cannot be observed"
                            ),
                        );
                    }
                }
                ProgramNode::Plate(inner) => {
                    let sub = Tree::from_declarations(inner, data, &join_path(path, name))?;
                    if !sub.is_empty() {
                        tree.insert_plate(name, sub);
                    }
                }
            }
        }
        Ok(tree)
    }
}

/// Data keys that are not declared anywhere in the model.
pub(crate) fn undeclared(data: &HashMap<String, NamedTensor>) -> Error {
    let mut names: Vec<String> = data.keys().cloned().collect();
    names.sort();
    Error::NameMismatch { names }
}
