//! Host-side tensors and the nested trees that carry model parameters,
//! optimizer state, and step outputs.

use crate::CollaboratorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dense row-major `f32` tensor held in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

/// Wire form of [`Tensor`], checked by [`Tensor::new`] on the way in.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = CollaboratorError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Self::new(raw.shape, raw.values)
    }
}

impl Tensor {
    /// Builds a tensor, checking that `values` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, CollaboratorError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(CollaboratorError::Shape(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    /// A rank-0 tensor.
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self { shape: Vec::new(), values: vec![value] }
    }

    /// A rank-1 tensor over `values`.
    #[must_use]
    pub fn vector(values: Vec<f32>) -> Self {
        Self { shape: vec![values.len()], values }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, values: vec![0.0; len] }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.values.len()
    }

    /// Bytes occupied by the tensor's values.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.values.len() * std::mem::size_of::<f32>()
    }

    /// Returns `len` entries of `axis` starting at `start`.
    pub fn slice_axis(&self, axis: usize, start: usize, len: usize) -> Result<Self, CollaboratorError> {
        let Some(&axis_len) = self.shape.get(axis) else {
            return Err(CollaboratorError::Shape(format!(
                "axis {} out of range for shape {:?}",
                axis, self.shape
            )));
        };
        if start + len > axis_len {
            return Err(CollaboratorError::Shape(format!(
                "slice {}..{} exceeds axis {} of size {}",
                start,
                start + len,
                axis,
                axis_len
            )));
        }

        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut values = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let from = (o * axis_len + start) * inner;
            values.extend_from_slice(&self.values[from..from + len * inner]);
        }

        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Self { shape, values })
    }

    /// Stacks equally shaped tensors along a new leading axis.
    pub fn stack(tensors: &[Self]) -> Result<Self, CollaboratorError> {
        let Some(first) = tensors.first() else {
            return Err(CollaboratorError::Shape("cannot stack zero tensors".to_string()));
        };
        let mut values = Vec::with_capacity(first.values.len() * tensors.len());
        for t in tensors {
            if t.shape != first.shape {
                return Err(CollaboratorError::Shape(format!(
                    "cannot stack shape {:?} with {:?}",
                    t.shape, first.shape
                )));
            }
            values.extend_from_slice(&t.values);
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(tensors.len());
        shape.extend_from_slice(&first.shape);
        Ok(Self { shape, values })
    }

    /// Elementwise mean of equally shaped tensors.
    pub fn mean(tensors: &[Self]) -> Result<Self, CollaboratorError> {
        let stacked = Self::stack(tensors)?;
        let n = tensors.len();
        let width = stacked.values.len() / n;
        let mut values = vec![0.0f32; width];
        for chunk in stacked.values.chunks(width) {
            for (acc, v) in values.iter_mut().zip(chunk) {
                *acc += v;
            }
        }
        for v in &mut values {
            *v /= n as f32;
        }
        Ok(Self { shape: stacked.shape[1..].to_vec(), values })
    }

    /// Converts the tensor into a JSON value: a number for scalars, nested
    /// arrays otherwise.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        fn nest(shape: &[usize], values: &[f32]) -> serde_json::Value {
            match shape.split_first() {
                None => serde_json::json!(values[0]),
                Some((&n, rest)) => {
                    let width: usize = rest.iter().product();
                    serde_json::Value::Array(
                        (0..n).map(|i| nest(rest, &values[i * width..(i + 1) * width])).collect(),
                    )
                }
            }
        }
        nest(&self.shape, &self.values)
    }
}

/// Nested, name-keyed tree of tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorTree {
    Leaf(Tensor),
    Node(BTreeMap<String, TensorTree>),
}

impl Default for TensorTree {
    fn default() -> Self {
        Self::Node(BTreeMap::new())
    }
}

impl TensorTree {
    /// Builds an interior node from `(name, subtree)` pairs.
    pub fn node<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, TensorTree)>,
        K: Into<String>,
    {
        Self::Node(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Direct child named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TensorTree> {
        match self {
            Self::Node(children) => children.get(name),
            Self::Leaf(_) => None,
        }
    }

    /// Descendant addressed by a `/`-separated path.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&TensorTree> {
        path.split('/').filter(|p| !p.is_empty()).try_fold(self, |tree, part| tree.get(part))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Node(children) => children.is_empty(),
            Self::Leaf(_) => false,
        }
    }

    /// All leaves with their `/`-joined paths, in key order.
    #[must_use]
    pub fn leaves(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a Tensor)>) {
        match self {
            Self::Leaf(t) => out.push((prefix, t)),
            Self::Node(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
                    child.collect_leaves(path, out);
                }
            }
        }
    }

    /// Rebuilds the tree with every leaf transformed by `f(path, tensor)`.
    pub fn try_map_leaves<E, F>(&self, f: &mut F) -> Result<TensorTree, E>
    where
        F: FnMut(&str, &Tensor) -> Result<Tensor, E>,
    {
        self.map_with_prefix("", f)
    }

    fn map_with_prefix<E, F>(&self, prefix: &str, f: &mut F) -> Result<TensorTree, E>
    where
        F: FnMut(&str, &Tensor) -> Result<Tensor, E>,
    {
        match self {
            Self::Leaf(t) => Ok(Self::Leaf(f(prefix, t)?)),
            Self::Node(children) => {
                let mut mapped = BTreeMap::new();
                for (name, child) in children {
                    let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
                    mapped.insert(name.clone(), child.map_with_prefix(&path, f)?);
                }
                Ok(Self::Node(mapped))
            }
        }
    }

    /// Bytes occupied by every leaf.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.leaves().iter().map(|(_, t)| t.size_bytes()).sum()
    }

    /// The shape skeleton of this tree.
    #[must_use]
    pub fn shape_tree(&self) -> ShapeTree {
        match self {
            Self::Leaf(t) => ShapeTree::Leaf(t.shape().to_vec()),
            Self::Node(children) => {
                ShapeTree::Node(children.iter().map(|(k, v)| (k.clone(), v.shape_tree())).collect())
            }
        }
    }
}

/// Shape-only mirror of a [`TensorTree`], used to restore or initialize state
/// without knowing its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeTree {
    Leaf(Vec<usize>),
    Node(BTreeMap<String, ShapeTree>),
}

impl ShapeTree {
    /// All leaf shapes with their `/`-joined paths.
    #[must_use]
    pub fn leaves(&self) -> Vec<(String, &[usize])> {
        let mut out = Vec::new();
        self.collect(String::new(), &mut out);
        out
    }

    fn collect<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a [usize])>) {
        match self {
            Self::Leaf(shape) => out.push((prefix, shape.as_slice())),
            Self::Node(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
                    child.collect(path, out);
                }
            }
        }
    }

    /// Builds a tensor tree with this shape, filling each leaf from `fill`.
    pub fn materialize<F>(&self, fill: &mut F) -> TensorTree
    where
        F: FnMut(&str, &[usize]) -> Vec<f32>,
    {
        self.materialize_with_prefix("", fill)
    }

    fn materialize_with_prefix<F>(&self, prefix: &str, fill: &mut F) -> TensorTree
    where
        F: FnMut(&str, &[usize]) -> Vec<f32>,
    {
        match self {
            Self::Leaf(shape) => {
                let values = fill(prefix, shape);
                TensorTree::Leaf(Tensor { shape: shape.clone(), values })
            }
            Self::Node(children) => TensorTree::Node(
                children
                    .iter()
                    .map(|(name, child)| {
                        let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
                        (name.clone(), child.materialize_with_prefix(&path, fill))
                    })
                    .collect(),
            ),
        }
    }
}
