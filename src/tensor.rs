//! Arrays whose axes are identified by name rather than by position.
//!
//! Every axis of a [`NamedTensor`] is a [`Dim`], either a plate dimension or
//! the K-dimension of a variable group. Binary operations align shared dims
//! and broadcast the rest, so callers never have to track axis order.

use std::{collections::BTreeMap, fmt, sync::Arc};

use itertools::Itertools;
use ndarray::{ArcArray, ArrayD, ArrayViewD, Axis, Dimension, IxDyn, ShapeError};
use thiserror::Error;

use crate::{
    error::{Error, Result},
    math::{logmeanexp, logsumexp},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DimKind {
    /// Independent replication over the elements of a plate.
    Plate,
    /// Particles of one variable group.
    K,
}

/// A named axis with a fixed extent.
///
/// Two dims are equal only if kind, name and size all agree, so a plate and a
/// group that happen to share a name never get aligned with each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dim {
    kind: DimKind,
    name: Arc<str>,
    size: usize,
}

impl Dim {
    pub fn plate(name: &str, size: usize) -> Self {
        Self {
            kind: DimKind::Plate,
            name: name.into(),
            size,
        }
    }

    pub fn k(name: &str, size: usize) -> Self {
        Self {
            kind: DimKind::K,
            name: name.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> DimKind {
        self.kind
    }

    pub fn is_k(&self) -> bool {
        self.kind == DimKind::K
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DimKind::Plate => write!(f, "{}({})", self.name, self.size),
            DimKind::K => write!(f, "K_{}({})", self.name, self.size),
        }
    }
}

/// The canonical plate dims of a problem, keyed by plate name.
pub type PlateDims = BTreeMap<String, Dim>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TensorError {
    #[error("Array of shape {shape:?} cannot be labelled with dims [{dims}]")]
    ShapeMismatch { dims: String, shape: Vec<usize> },
    #[error("Dim {0} appears more than once")]
    DuplicateDim(String),
    #[error("Dim {0} is not present")]
    MissingDim(String),
    #[error("Particle index {index} is out of range for {dim}")]
    IndexOutOfRange { dim: String, index: usize },
    #[error("Invalid array shape")]
    Shape(#[from] ShapeError),
}

fn shape_of(dims: &[Dim]) -> IxDyn {
    IxDyn(&dims.iter().map(Dim::size).collect_vec())
}

fn position_of(dims: &[Dim], dim: &Dim) -> std::result::Result<usize, TensorError> {
    dims.iter()
        .position(|d| d == dim)
        .ok_or_else(|| TensorError::MissingDim(dim.to_string()))
}

fn check_dims(dims: &[Dim], shape: &[usize]) -> std::result::Result<(), TensorError> {
    if dims.len() != shape.len() || dims.iter().zip(shape).any(|(d, &n)| d.size() != n) {
        return Err(TensorError::ShapeMismatch {
            dims: dims.iter().join(", "),
            shape: shape.to_vec(),
        });
    }
    if let Some(dup) = dims.iter().duplicates().next() {
        return Err(TensorError::DuplicateDim(dup.to_string()));
    }
    Ok(())
}

/// All dims of the inputs, in order of first appearance.
pub(crate) fn union_dims<'a>(all: impl IntoIterator<Item = &'a [Dim]>) -> Vec<Dim> {
    let mut dims: Vec<Dim> = Vec::new();
    for dim in all.into_iter().flatten() {
        if !dims.contains(dim) {
            dims.push(dim.clone());
        }
    }
    dims
}

/// A reference counted `f64` array with one [`Dim`] per axis.
///
/// Cloning is shallow, which keeps copy-on-extend scopes cheap.
#[derive(Clone, Debug)]
pub struct NamedTensor {
    dims: Vec<Dim>,
    data: ArcArray<f64, IxDyn>,
}

impl NamedTensor {
    pub fn new(dims: Vec<Dim>, data: ArrayD<f64>) -> std::result::Result<Self, TensorError> {
        check_dims(&dims, data.shape())?;
        Ok(Self {
            dims,
            data: data.into_shared(),
        })
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            dims: Vec::new(),
            data: ArrayD::from_elem(IxDyn(&[]), value).into_shared(),
        }
    }

    pub fn from_elem(dims: Vec<Dim>, value: f64) -> std::result::Result<Self, TensorError> {
        let data = ArrayD::from_elem(shape_of(&dims), value);
        Self::new(dims, data)
    }

    pub fn from_shape_fn(
        dims: Vec<Dim>,
        mut f: impl FnMut(&[usize]) -> f64,
    ) -> std::result::Result<Self, TensorError> {
        let data = ArrayD::from_shape_fn(shape_of(&dims), |index| f(index.slice()));
        Self::new(dims, data)
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn has_dim(&self, dim: &Dim) -> bool {
        self.dims.contains(dim)
    }

    pub fn k_dims(&self) -> impl Iterator<Item = &Dim> {
        self.dims.iter().filter(|dim| dim.is_k())
    }

    pub fn data(&self) -> ArrayViewD<'_, f64> {
        self.data.view()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values in row-major order of [`Self::dims`].
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied()
    }

    /// The value of a tensor without dims.
    pub fn item(&self) -> Option<f64> {
        if self.dims.is_empty() {
            self.data.iter().next().copied()
        } else {
            None
        }
    }

    /// Look up one element by naming a coordinate for every dim.
    pub fn at(&self, coords: &[(&Dim, usize)]) -> Option<f64> {
        let mut index = Vec::with_capacity(self.dims.len());
        for dim in self.dims.iter() {
            let (_, i) = coords.iter().find(|(d, _)| *d == dim)?;
            index.push(*i);
        }
        self.data.get(&index[..]).copied()
    }

    /// A view with axes ordered like `target` and unit axes for the dims this
    /// tensor lacks. `target` must contain every dim of `self`.
    fn expanded(&self, target: &[Dim]) -> std::result::Result<ArrayViewD<'_, f64>, TensorError> {
        let mut order = Vec::with_capacity(self.dims.len());
        for (axis, dim) in self.dims.iter().enumerate() {
            order.push((position_of(target, dim)?, axis));
        }
        order.sort_unstable();
        let perm = order.iter().map(|&(_, axis)| axis).collect_vec();

        let mut view = self.data.view().permuted_axes(IxDyn(&perm));
        for (pos, dim) in target.iter().enumerate() {
            if !self.has_dim(dim) {
                view = view.insert_axis(Axis(pos));
            }
        }
        Ok(view)
    }

    /// Apply `f` elementwise over the aligned and broadcast inputs.
    ///
    /// The result is indexed by the union of the input dims. `f` receives one
    /// value per input, in input order.
    pub fn map_many(
        tensors: &[&NamedTensor],
        mut f: impl FnMut(&[f64]) -> f64,
    ) -> std::result::Result<Self, TensorError> {
        let dims = union_dims(tensors.iter().map(|t| t.dims()));
        let shape = shape_of(&dims);

        let expanded = tensors
            .iter()
            .map(|t| t.expanded(&dims))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let broadcast = expanded
            .iter()
            .map(|view| {
                view.broadcast(shape.clone())
                    .ok_or_else(|| TensorError::ShapeMismatch {
                        dims: dims.iter().join(", "),
                        shape: view.shape().to_vec(),
                    })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut iters = broadcast.iter().map(|view| view.iter()).collect_vec();
        let mut args = vec![0f64; tensors.len()];
        let len = shape.size();
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            for (arg, iter) in args.iter_mut().zip(iters.iter_mut()) {
                *arg = iter.next().copied().unwrap_or(f64::NAN);
            }
            values.push(f(&args));
        }

        Self::new(dims, ArrayD::from_shape_vec(shape, values)?)
    }

    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> Self {
        Self {
            dims: self.dims.clone(),
            data: self.data.map(|&x| f(x)).into_shared(),
        }
    }

    pub fn add_tensor(&self, other: &Self) -> std::result::Result<Self, TensorError> {
        Self::map_many(&[self, other], |x| x[0] + x[1])
    }

    pub fn sub_tensor(&self, other: &Self) -> std::result::Result<Self, TensorError> {
        Self::map_many(&[self, other], |x| x[0] - x[1])
    }

    /// Sum of all tensors, broadcast to the union of their dims.
    pub fn sum_tensors<'a>(
        tensors: impl IntoIterator<Item = &'a NamedTensor>,
    ) -> std::result::Result<Self, TensorError> {
        let tensors = tensors.into_iter().collect_vec();
        Self::map_many(&tensors, |x| x.iter().sum())
    }

    fn without(&self, dim: &Dim) -> Vec<Dim> {
        self.dims.iter().filter(|d| *d != dim).cloned().collect()
    }

    fn reduce_lanes(
        &self,
        dim: &Dim,
        f: impl Fn(&[f64]) -> f64,
    ) -> std::result::Result<Self, TensorError> {
        let axis = Axis(position_of(&self.dims, dim)?);
        let data = self.data.map_axis(axis, |lane| match lane.as_slice() {
            Some(values) => f(values),
            None => f(&lane.to_vec()),
        });
        Self::new(self.without(dim), data)
    }

    pub fn sum_dim(&self, dim: &Dim) -> std::result::Result<Self, TensorError> {
        let axis = Axis(position_of(&self.dims, dim)?);
        let data = self.data.sum_axis(axis);
        Self::new(self.without(dim), data)
    }

    /// Sum over a plate. A tensor constant along the plate contributes once
    /// per element.
    pub fn sum_plate(&self, dim: &Dim) -> std::result::Result<Self, TensorError> {
        if self.has_dim(dim) {
            self.sum_dim(dim)
        } else {
            let size = dim.size() as f64;
            Ok(self.map(|x| x * size))
        }
    }

    pub fn logsumexp_dim(&self, dim: &Dim) -> std::result::Result<Self, TensorError> {
        self.reduce_lanes(dim, logsumexp)
    }

    /// `logsumexp` over `dim` minus `ln(dim.size())`.
    pub fn logmeanexp_dim(&self, dim: &Dim) -> std::result::Result<Self, TensorError> {
        self.reduce_lanes(dim, logmeanexp)
    }

    /// Replace K-dims by resampled particle indices.
    ///
    /// Every dim of `self` that is the source of one of `indices` is removed;
    /// the element at each output position is read at the particle given by
    /// that index. The output gains the dims of the used indices. Indices
    /// whose source is absent are ignored.
    pub fn gather(&self, indices: &[KIndex]) -> std::result::Result<Self, TensorError> {
        let used = indices
            .iter()
            .filter(|index| self.has_dim(&index.source))
            .collect_vec();
        if used.is_empty() {
            return Ok(self.clone());
        }

        let kept = self
            .dims
            .iter()
            .filter(|dim| !used.iter().any(|index| index.source == **dim))
            .cloned()
            .collect_vec();
        let dims = union_dims(
            std::iter::once(kept.as_slice()).chain(used.iter().map(|index| index.dims.as_slice())),
        );

        enum Source {
            Out(usize),
            Index(usize),
        }
        let sources = self
            .dims
            .iter()
            .map(|dim| match used.iter().position(|index| index.source == *dim) {
                Some(n) => Ok(Source::Index(n)),
                None => position_of(&dims, dim).map(Source::Out),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let index_positions = used
            .iter()
            .map(|index| {
                index
                    .dims
                    .iter()
                    .map(|dim| position_of(&dims, dim))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut index_buf = index_positions
            .iter()
            .map(|positions| vec![0usize; positions.len()])
            .collect_vec();
        let mut src = vec![0usize; self.dims.len()];
        let data = ArrayD::from_shape_fn(shape_of(&dims), |out| {
            let out = out.slice();
            for (buf, positions) in index_buf.iter_mut().zip(index_positions.iter()) {
                for (slot, &pos) in buf.iter_mut().zip(positions) {
                    *slot = out[pos];
                }
            }
            for (slot, source) in src.iter_mut().zip(sources.iter()) {
                *slot = match *source {
                    Source::Out(pos) => out[pos],
                    Source::Index(n) => used[n].data[&index_buf[n][..]],
                };
            }
            self.data[&src[..]]
        });
        Self::new(dims, data)
    }
}

/// Particle indices into the K-dim `source`, laid out over `dims`.
///
/// Produced by a [`SamplingType`](crate::SamplingType) to decide which parent
/// particle each child particle is conditioned on.
#[derive(Clone, Debug)]
pub struct KIndex {
    source: Dim,
    dims: Vec<Dim>,
    data: ArrayD<usize>,
}

impl KIndex {
    pub fn new(
        source: Dim,
        dims: Vec<Dim>,
        data: ArrayD<usize>,
    ) -> std::result::Result<Self, TensorError> {
        check_dims(&dims, data.shape())?;
        if let Some(&index) = data.iter().find(|&&index| index >= source.size()) {
            return Err(TensorError::IndexOutOfRange {
                dim: source.to_string(),
                index,
            });
        }
        Ok(Self { source, dims, data })
    }

    pub fn from_fn(
        source: Dim,
        dims: Vec<Dim>,
        mut f: impl FnMut(&[usize]) -> usize,
    ) -> std::result::Result<Self, TensorError> {
        let data = ArrayD::from_shape_fn(shape_of(&dims), |index| f(index.slice()));
        Self::new(source, dims, data)
    }

    pub fn source(&self) -> &Dim {
        &self.source
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn data(&self) -> &ArrayD<usize> {
        &self.data
    }
}

/// An array labelled with plate names, as supplied by callers for data,
/// inputs and parameters.
#[derive(Clone, Debug)]
pub struct AxisArray {
    axes: Vec<String>,
    array: ArrayD<f64>,
}

impl AxisArray {
    pub fn new<S: Into<String>>(axes: impl IntoIterator<Item = S>, array: ArrayD<f64>) -> Self {
        Self {
            axes: axes.into_iter().map(Into::into).collect(),
            array,
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self::new(Vec::<String>::new(), ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    pub fn array(&self) -> &ArrayD<f64> {
        &self.array
    }

    /// Resolve the axis names against the plate dims of a problem.
    pub fn to_named(&self, all_platedims: &PlateDims) -> Result<NamedTensor> {
        if self.axes.len() != self.array.ndim() {
            return Err(TensorError::ShapeMismatch {
                dims: self.axes.join(", "),
                shape: self.array.shape().to_vec(),
            }
            .into());
        }
        let mut dims = Vec::with_capacity(self.axes.len());
        for (axis, &len) in self.axes.iter().zip(self.array.shape()) {
            let dim = all_platedims
                .get(axis)
                .ok_or_else(|| Error::UnknownPlate(axis.clone()))?;
            if dim.size() != len {
                return Err(Error::PlateSizeMismatch {
                    plate: axis.clone(),
                    expected: dim.size(),
                    found: len,
                });
            }
            dims.push(dim.clone());
        }
        Ok(NamedTensor::new(dims, self.array.clone())?)
    }
}

impl From<f64> for AxisArray {
    fn from(value: f64) -> Self {
        Self::scalar(value)
    }
}
