//! Named tensor storage shared by the host executor and the passes.

use std::collections::BTreeMap;

use crate::desc::DataType;

/// Typed element storage of a [`Tensor`].
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Self::F32(_) => DataType::F32,
            Self::I8(_) => DataType::I8,
            Self::U8(_) => DataType::U8,
            Self::I32(_) => DataType::I32,
        }
    }
}

/// A dense row-major tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub dims: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    /// Create a tensor from dims and data.
    ///
    /// # Panics
    ///
    /// Panics if the element count does not match the product of `dims`.
    pub fn new(dims: Vec<usize>, data: TensorData) -> Self {
        let expected: usize = dims.iter().product();
        assert_eq!(
            expected,
            data.len(),
            "tensor dims {dims:?} need {expected} elements, got {}",
            data.len()
        );
        Self { dims, data }
    }

    pub fn from_f32(dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self::new(dims, TensorData::F32(data))
    }

    pub fn from_i8(dims: Vec<usize>, data: Vec<i8>) -> Self {
        Self::new(dims, TensorData::I8(data))
    }

    pub fn from_i32(dims: Vec<usize>, data: Vec<i32>) -> Self {
        Self::new(dims, TensorData::I32(data))
    }

    /// A rank-1 `f32` tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self::from_f32(vec![data.len()], data)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }
}

/// Variable storage keyed by variable name.
///
/// Persistable tensors (weights, biases) live here across runs; the
/// executor also writes activations here during a warmup run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scope {
    vars: BTreeMap<String, Tensor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `tensor` under `name`, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.vars.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.vars.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.vars.remove(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variable names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}
