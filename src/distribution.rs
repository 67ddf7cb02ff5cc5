//! Distributions of random variables, conditioned on the current scope.
//!
//! A distribution reads its parameters from the [`Scope`] by name, so both
//! sampling and density evaluation inherit the named dims of the values it
//! conditions on.

use std::{f64::consts::PI, fmt, sync::Arc};

use itertools::Itertools;
use rand::{Rng, RngCore};
use rand_distr::{Distribution as _, Exp, Exp1, StandardNormal};
use thiserror::Error;

use crate::{
    scope::Scope,
    tensor::{Dim, NamedTensor, TensorError},
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("`{0}` is not bound in scope")]
    MissingName(String),
    #[error("Invalid value for parameter `{param}`")]
    InvalidParameter { param: &'static str },
    #[error("Tensor operation failed")]
    Tensor(#[from] TensorError),
}

/// A family of distributions whose parameters come from a scope.
///
/// Implementations draw elementwise: a sample is indexed by the union of
/// `sample_dims` and the dims of the resolved parameters.
pub trait Distribution: fmt::Debug + Send + Sync {
    /// Draw one value for every element of the broadcast parameters.
    ///
    /// `reparam` asks for a pathwise draw (a deterministic function of the
    /// parameters and parameter-free noise). It is only passed as `true` if
    /// [`Self::has_rsample`] returns `true`.
    fn sample(
        &self,
        scope: &Scope,
        sample_dims: &[Dim],
        reparam: bool,
        rng: &mut dyn RngCore,
    ) -> Result<NamedTensor, DistributionError>;

    fn log_prob(
        &self,
        value: &NamedTensor,
        scope: &Scope,
    ) -> Result<NamedTensor, DistributionError>;

    fn has_rsample(&self) -> bool;

    /// Names read from the scope.
    fn parents(&self) -> Vec<String>;
}

type ParamFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// A distribution parameter.
#[derive(Clone)]
pub enum Param {
    Const(f64),
    /// The value bound to this name.
    Name(String),
    /// An elementwise function of several bound values, called with one
    /// value per name in `args`.
    Expr { args: Vec<String>, f: ParamFn },
}

impl Param {
    pub fn expr(args: &[&str], f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Self {
        Param::Expr {
            args: args.iter().map(|arg| arg.to_string()).collect(),
            f: Arc::new(f),
        }
    }

    pub fn resolve(&self, scope: &Scope) -> Result<NamedTensor, DistributionError> {
        match self {
            Param::Const(value) => Ok(NamedTensor::scalar(*value)),
            Param::Name(name) => lookup(scope, name).cloned(),
            Param::Expr { args, f } => {
                let values = args
                    .iter()
                    .map(|name| lookup(scope, name))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(NamedTensor::map_many(&values, |x| f(x))?)
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        match self {
            Param::Const(_) => Vec::new(),
            Param::Name(name) => vec![name.clone()],
            Param::Expr { args, .. } => args.clone(),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Const(value) => write!(f, "{value}"),
            Param::Name(name) => write!(f, "{name}"),
            Param::Expr { args, .. } => write!(f, "<expr of {}>", args.join(", ")),
        }
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Const(value)
    }
}

impl From<&str> for Param {
    fn from(name: &str) -> Self {
        Param::Name(name.to_string())
    }
}

impl From<String> for Param {
    fn from(name: String) -> Self {
        Param::Name(name)
    }
}

fn lookup<'a>(scope: &'a Scope, name: &str) -> Result<&'a NamedTensor, DistributionError> {
    scope
        .get(name)
        .ok_or_else(|| DistributionError::MissingName(name.to_string()))
}

fn parents_of(params: &[&Param]) -> Vec<String> {
    params
        .iter()
        .flat_map(|param| param.names())
        .unique()
        .collect()
}

fn check_param(
    param: &'static str,
    value: &NamedTensor,
    valid: impl Fn(f64) -> bool,
) -> Result<(), DistributionError> {
    if value.iter().all(valid) {
        Ok(())
    } else {
        Err(DistributionError::InvalidParameter { param })
    }
}

fn sample_shape(sample_dims: &[Dim]) -> Result<NamedTensor, DistributionError> {
    Ok(NamedTensor::from_elem(sample_dims.to_vec(), 0.)?)
}

#[derive(Debug, Clone)]
pub struct Normal {
    loc: Param,
    scale: Param,
}

impl Normal {
    pub fn new(loc: impl Into<Param>, scale: impl Into<Param>) -> Self {
        Self {
            loc: loc.into(),
            scale: scale.into(),
        }
    }
}

impl Distribution for Normal {
    fn sample(
        &self,
        scope: &Scope,
        sample_dims: &[Dim],
        reparam: bool,
        rng: &mut dyn RngCore,
    ) -> Result<NamedTensor, DistributionError> {
        let loc = self.loc.resolve(scope)?;
        let scale = self.scale.resolve(scope)?;
        check_param("scale", &scale, |s| s > 0. && s.is_finite())?;
        let shape = sample_shape(sample_dims)?;

        let value = if reparam {
            NamedTensor::map_many(&[&shape, &loc, &scale], |x| {
                let eps: f64 = rng.sample(StandardNormal);
                x[1] + x[2] * eps
            })?
        } else {
            NamedTensor::map_many(&[&shape, &loc, &scale], |x| {
                rand_distr::Normal::new(x[1], x[2])
                    .map(|dist| dist.sample(&mut *rng))
                    .unwrap_or(f64::NAN)
            })?
        };
        Ok(value)
    }

    fn log_prob(
        &self,
        value: &NamedTensor,
        scope: &Scope,
    ) -> Result<NamedTensor, DistributionError> {
        let loc = self.loc.resolve(scope)?;
        let scale = self.scale.resolve(scope)?;
        check_param("scale", &scale, |s| s > 0. && s.is_finite())?;
        let norm = 0.5 * (2. * PI).ln();
        Ok(NamedTensor::map_many(&[value, &loc, &scale], |x| {
            let z = (x[0] - x[1]) / x[2];
            -0.5 * z * z - x[2].ln() - norm
        })?)
    }

    fn has_rsample(&self) -> bool {
        true
    }

    fn parents(&self) -> Vec<String> {
        parents_of(&[&self.loc, &self.scale])
    }
}

#[derive(Debug, Clone)]
pub struct Exponential {
    rate: Param,
}

impl Exponential {
    pub fn new(rate: impl Into<Param>) -> Self {
        Self { rate: rate.into() }
    }
}

impl Distribution for Exponential {
    fn sample(
        &self,
        scope: &Scope,
        sample_dims: &[Dim],
        reparam: bool,
        rng: &mut dyn RngCore,
    ) -> Result<NamedTensor, DistributionError> {
        let rate = self.rate.resolve(scope)?;
        check_param("rate", &rate, |r| r > 0. && r.is_finite())?;
        let shape = sample_shape(sample_dims)?;

        let value = if reparam {
            NamedTensor::map_many(&[&shape, &rate], |x| {
                let noise: f64 = rng.sample(Exp1);
                noise / x[1]
            })?
        } else {
            NamedTensor::map_many(&[&shape, &rate], |x| {
                Exp::new(x[1])
                    .map(|dist| dist.sample(&mut *rng))
                    .unwrap_or(f64::NAN)
            })?
        };
        Ok(value)
    }

    fn log_prob(
        &self,
        value: &NamedTensor,
        scope: &Scope,
    ) -> Result<NamedTensor, DistributionError> {
        let rate = self.rate.resolve(scope)?;
        check_param("rate", &rate, |r| r > 0. && r.is_finite())?;
        Ok(NamedTensor::map_many(&[value, &rate], |x| {
            if x[0] >= 0. {
                x[1].ln() - x[1] * x[0]
            } else {
                f64::NEG_INFINITY
            }
        })?)
    }

    fn has_rsample(&self) -> bool {
        true
    }

    fn parents(&self) -> Vec<String> {
        parents_of(&[&self.rate])
    }
}

/// Distribution over `{0, 1}`. Draws are discrete, so there is no pathwise
/// sampler.
#[derive(Debug, Clone)]
pub struct Bernoulli {
    probs: Param,
}

impl Bernoulli {
    pub fn new(probs: impl Into<Param>) -> Self {
        Self {
            probs: probs.into(),
        }
    }
}

impl Distribution for Bernoulli {
    fn sample(
        &self,
        scope: &Scope,
        sample_dims: &[Dim],
        _reparam: bool,
        rng: &mut dyn RngCore,
    ) -> Result<NamedTensor, DistributionError> {
        let probs = self.probs.resolve(scope)?;
        check_param("probs", &probs, |p| (0. ..=1.).contains(&p))?;
        let shape = sample_shape(sample_dims)?;
        Ok(NamedTensor::map_many(&[&shape, &probs], |x| {
            if rng.random::<f64>() < x[1] {
                1.
            } else {
                0.
            }
        })?)
    }

    fn log_prob(
        &self,
        value: &NamedTensor,
        scope: &Scope,
    ) -> Result<NamedTensor, DistributionError> {
        let probs = self.probs.resolve(scope)?;
        check_param("probs", &probs, |p| (0. ..=1.).contains(&p))?;
        Ok(NamedTensor::map_many(&[value, &probs], |x| {
            if x[0] == 1. {
                x[1].ln()
            } else if x[0] == 0. {
                (-x[1]).ln_1p()
            } else {
                f64::NEG_INFINITY
            }
        })?)
    }

    fn has_rsample(&self) -> bool {
        false
    }

    fn parents(&self) -> Vec<String> {
        parents_of(&[&self.probs])
    }
}
