use std::collections::{BTreeMap, HashSet};

use rand::RngCore;

use crate::{
    error::{Error, Result},
    plate::Plate,
    sampling_type::SamplingType,
    scope::Scope,
    tensor::{AxisArray, Dim, NamedTensor, PlateDims},
    tree::Tree,
};

/// A [`Plate`] together with the fixed inputs and the parameters it reads.
///
/// Inputs and parameters are labelled with plate names and resolved against
/// the plate dims of a problem whenever the plate is sampled or evaluated.
/// Their names may not collide with each other or with any name declared in
/// the plate.
#[derive(Debug)]
pub struct BoundPlate {
    plate: Plate,
    inputs: BTreeMap<String, AxisArray>,
    parameters: BTreeMap<String, AxisArray>,
}

impl From<Plate> for BoundPlate {
    fn from(plate: Plate) -> Self {
        Self {
            plate,
            inputs: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }
}

impl BoundPlate {
    pub fn new<I, P, S, T>(plate: Plate, inputs: I, parameters: P) -> Result<Self>
    where
        I: IntoIterator<Item = (S, AxisArray)>,
        P: IntoIterator<Item = (T, AxisArray)>,
        S: Into<String>,
        T: Into<String>,
    {
        let inputs: BTreeMap<String, AxisArray> = inputs
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();
        let parameters: BTreeMap<String, AxisArray> = parameters
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();

        let declared: HashSet<String> = plate.all_declared_names().into_iter().collect();
        let mut collisions: Vec<String> = inputs
            .keys()
            .filter(|name| parameters.contains_key(*name) || declared.contains(*name))
            .chain(parameters.keys().filter(|name| declared.contains(*name)))
            .cloned()
            .collect();
        collisions.sort();
        collisions.dedup();
        if !collisions.is_empty() {
            return Err(Error::NameCollision { names: collisions });
        }

        Ok(Self {
            plate,
            inputs,
            parameters,
        })
    }

    pub fn plate(&self) -> &Plate {
        &self.plate
    }

    pub fn inputs(&self) -> &BTreeMap<String, AxisArray> {
        &self.inputs
    }

    pub fn parameters(&self) -> &BTreeMap<String, AxisArray> {
        &self.parameters
    }

    /// `scope` extended by the inputs, then by the parameters.
    pub fn update_scope(&self, scope: &Scope, all_platedims: &PlateDims) -> Result<Scope> {
        fn resolve<'a>(
            values: &'a BTreeMap<String, AxisArray>,
            all_platedims: &PlateDims,
        ) -> Result<Vec<(&'a str, NamedTensor)>> {
            values
                .iter()
                .map(|(name, value)| Ok((name.as_str(), value.to_named(all_platedims)?)))
                .collect()
        }
        let inputs = resolve(&self.inputs, all_platedims)?;
        let parameters = resolve(&self.parameters, all_platedims)?;
        Ok(scope
            .extended(inputs.iter().map(|(name, value)| (*name, value)))
            .extended(parameters.iter().map(|(name, value)| (*name, value))))
    }

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
        self.plate.sample(
            &self.update_scope(scope, all_platedims)?,
            active_platedims,
            all_platedims,
            sampling_type,
            groupvarname2kdim,
            reparam,
            rng,
        )
    }

    pub fn log_prob(
        &self,
        sample: &Tree<NamedTensor>,
        scope: &Scope,
        active_platedims: &[Dim],
        all_platedims: &PlateDims,
        groupvarname2kdim: &BTreeMap<String, Dim>,
    ) -> Result<Tree<NamedTensor>> {
        self.plate.log_prob(
            sample,
            &self.update_scope(scope, all_platedims)?,
            active_platedims,
            all_platedims,
            groupvarname2kdim,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Normal;
    use ndarray::{arr1, ArrayD};
    use pretty_assertions::assert_eq;

    fn column(values: &[f64]) -> ArrayD<f64> {
        arr1(values).into_dyn()
    }

    #[test]
    fn collisions_are_rejected() {
        let plate = Plate::new().var("a", Normal::new("w", 1.));
        let err = BoundPlate::new(
            plate,
            [("w", AxisArray::scalar(1.)), ("a", AxisArray::scalar(0.))],
            [("w", AxisArray::scalar(2.))],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::NameCollision { names } if names == vec!["a".to_string(), "w".to_string()]
        ));
    }

    #[test]
    fn scope_gets_inputs_and_parameters() {
        let plate = Plate::new().plate("p", Plate::new().var("x", Normal::new("loc", "scale")));
        let bound = BoundPlate::new(
            plate,
            [("loc", AxisArray::new(["p"], column(&[1., 2.])))],
            [("scale", AxisArray::scalar(0.5))],
        )
        .unwrap();
        let platedims: PlateDims = [("p".to_string(), Dim::plate("p", 2))].into_iter().collect();

        let scope = bound.update_scope(&Scope::new(), &platedims).unwrap();
        assert_eq!(scope.len(), 2);
        assert_eq!(scope.get("loc").unwrap().dims(), &[Dim::plate("p", 2)]);
        assert_eq!(scope.get("scale").and_then(NamedTensor::item), Some(0.5));

        let short: PlateDims = [("p".to_string(), Dim::plate("p", 3))].into_iter().collect();
        let err = bound.update_scope(&Scope::new(), &short).unwrap_err();
        assert!(matches!(err, Error::PlateSizeMismatch { expected: 3, found: 2, .. }));
    }
}
