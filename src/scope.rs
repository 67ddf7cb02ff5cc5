use std::collections::HashMap;

use crate::tensor::NamedTensor;

/// Names visible at one point of the recursive walk over a plate tree.
///
/// A scope is never changed in place: every extension returns a new scope,
/// so sibling calls cannot observe each other's bindings. Tensors are
/// reference counted, which makes the copies shallow.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    values: HashMap<String, NamedTensor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NamedTensor)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// A copy of this scope with `name` bound to `value`, shadowing any
    /// earlier binding.
    pub fn with(&self, name: &str, value: NamedTensor) -> Self {
        let mut values = self.values.clone();
        values.insert(name.to_string(), value);
        Self { values }
    }

    /// A copy of this scope with all `bindings` added, later ones shadowing
    /// earlier ones.
    pub fn extended<'a>(
        &self,
        bindings: impl IntoIterator<Item = (&'a str, &'a NamedTensor)>,
    ) -> Self {
        let mut values = self.values.clone();
        values.extend(
            bindings
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.clone())),
        );
        Self { values }
    }
}

impl<'a> FromIterator<(&'a str, NamedTensor)> for Scope {
    fn from_iter<T: IntoIterator<Item = (&'a str, NamedTensor)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }
}
