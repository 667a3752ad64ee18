use std::sync::Arc;

use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::DType;

/// Dense storage backing a [`HostTensor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::F64(values) => values.len(),
            TensorData::I32(values) => values.len(),
            TensorData::I64(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("tensor data holds {actual} elements but dims {dims:?} need {expected}")]
    ElementCount {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("dtype {dtype} cannot be stored in {storage} storage")]
    StorageMismatch { dtype: DType, storage: &'static str },
    #[error("cannot reshape {from:?} into {to:?}")]
    Reshape { from: Vec<usize>, to: Vec<usize> },
}

/// Host-resident tensor exchanged with interpreters and engines.
///
/// `F16` values live in `F32` storage rounded through `half::f16`; `I8` values
/// live in `I32` storage clamped to the `i8` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    dtype: DType,
    dims: Vec<usize>,
    data: TensorData,
}

fn storage_name(data: &TensorData) -> &'static str {
    match data {
        TensorData::F32(_) => "f32",
        TensorData::F64(_) => "f64",
        TensorData::I32(_) => "i32",
        TensorData::I64(_) => "i64",
        TensorData::Bool(_) => "bool",
    }
}

fn storage_matches(dtype: DType, data: &TensorData) -> bool {
    matches!(
        (dtype, data),
        (DType::F32 | DType::F16, TensorData::F32(_))
            | (DType::F64, TensorData::F64(_))
            | (DType::I32 | DType::I8, TensorData::I32(_))
            | (DType::I64, TensorData::I64(_))
            | (DType::Bool, TensorData::Bool(_))
    )
}

pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

impl HostTensor {
    pub fn new(dtype: DType, dims: Vec<usize>, data: TensorData) -> Result<Self, TensorError> {
        if !storage_matches(dtype, &data) {
            return Err(TensorError::StorageMismatch {
                dtype,
                storage: storage_name(&data),
            });
        }
        let expected = element_count(&dims);
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                dims,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, dims, data })
    }

    pub fn from_f32(dims: Vec<usize>, values: Vec<f32>) -> Result<Self, TensorError> {
        Self::new(DType::F32, dims, TensorData::F32(values.into()))
    }

    pub fn from_i64(dims: Vec<usize>, values: Vec<i64>) -> Result<Self, TensorError> {
        Self::new(DType::I64, dims, TensorData::I64(values.into()))
    }

    pub fn from_i32(dims: Vec<usize>, values: Vec<i32>) -> Result<Self, TensorError> {
        Self::new(DType::I32, dims, TensorData::I32(values.into()))
    }

    pub fn from_bool(dims: Vec<usize>, values: Vec<bool>) -> Result<Self, TensorError> {
        let bytes: Vec<u8> = values.into_iter().map(u8::from).collect();
        Self::new(DType::Bool, dims, TensorData::Bool(bytes.into()))
    }

    /// Rank-0 tensor.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            dtype: DType::F32,
            dims: Vec::new(),
            data: TensorData::F32(vec![value].into()),
        }
    }

    /// Builds a tensor of `dtype` from `f64` values, rounding to the storage type.
    pub fn from_f64_values(dtype: DType, dims: Vec<usize>, values: &[f64]) -> Result<Self, TensorError> {
        let data = match dtype {
            DType::F32 => TensorData::F32(values.iter().map(|v| *v as f32).collect()),
            DType::F16 => TensorData::F32(values.iter().map(|v| round_f16(*v as f32)).collect()),
            DType::F64 => TensorData::F64(values.iter().copied().collect()),
            DType::I8 => TensorData::I32(
                values
                    .iter()
                    .map(|v| (v.trunc() as i64).clamp(i8::MIN as i64, i8::MAX as i64) as i32)
                    .collect(),
            ),
            DType::I32 => TensorData::I32(values.iter().map(|v| v.trunc() as i32).collect()),
            DType::I64 => TensorData::I64(values.iter().map(|v| v.trunc() as i64).collect()),
            DType::Bool => TensorData::Bool(values.iter().map(|v| u8::from(*v != 0.0)).collect()),
        };
        Self::new(dtype, dims, data)
    }

    pub fn full(dtype: DType, dims: Vec<usize>, value: f64) -> Self {
        let count = element_count(&dims);
        let values = vec![value; count];
        Self::from_f64_values(dtype, dims, &values)
            .unwrap_or_else(|_| unreachable!("element count matches dims by construction"))
    }

    pub fn ones(dtype: DType, dims: Vec<usize>) -> Self {
        Self::full(dtype, dims, 1.0)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Widens every element to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            TensorData::F32(values) => values.iter().map(|v| *v as f64).collect(),
            TensorData::F64(values) => values.to_vec(),
            TensorData::I32(values) => values.iter().map(|v| *v as f64).collect(),
            TensorData::I64(values) => values.iter().map(|v| *v as f64).collect(),
            TensorData::Bool(values) => values.iter().map(|v| f64::from(*v)).collect(),
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(values) => values.to_vec(),
            _ => self.to_f64_vec().into_iter().map(|v| v as f32).collect(),
        }
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        match &self.data {
            TensorData::I64(values) => values.to_vec(),
            TensorData::I32(values) => values.iter().map(|v| *v as i64).collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as i64).collect(),
        }
    }

    /// Converts to `dtype`; a no-op clone when the dtype already matches.
    pub fn cast(&self, dtype: DType) -> HostTensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let values = self.to_f64_vec();
        HostTensor::from_f64_values(dtype, self.dims.clone(), &values)
            .unwrap_or_else(|_| unreachable!("cast preserves element count"))
    }

    /// Reinterprets the same elements under new dims.
    pub fn reshape(&self, dims: Vec<usize>) -> Result<HostTensor, TensorError> {
        if element_count(&dims) != self.len() {
            return Err(TensorError::Reshape {
                from: self.dims.clone(),
                to: dims,
            });
        }
        Ok(HostTensor {
            dtype: self.dtype,
            dims,
            data: self.data.clone(),
        })
    }

    /// Largest absolute element, `0` for empty tensors.
    pub fn max_abs(&self) -> f64 {
        self.to_f64_vec()
            .into_iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

pub fn round_f16(value: f32) -> f32 {
    f16::from_f32(value).to_f32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_values_are_rounded_on_construction() {
        let tensor = HostTensor::from_f64_values(DType::F16, vec![1], &[0.1]).expect("tensor");
        let stored = tensor.to_f32_vec()[0];
        assert_ne!(stored, 0.1_f32);
        assert_eq!(stored, f16::from_f32(0.1).to_f32());
    }

    #[test]
    fn element_count_is_checked() {
        let err = HostTensor::from_f32(vec![2, 2], vec![1.0; 3]).expect_err("count mismatch");
        assert!(matches!(err, TensorError::ElementCount { expected: 4, actual: 3, .. }));
    }

    #[test]
    fn cast_truncates_long_to_int() {
        let tensor = HostTensor::from_i64(vec![2], vec![7, -3]).expect("tensor");
        let cast = tensor.cast(DType::I32);
        assert_eq!(cast.dtype(), DType::I32);
        assert_eq!(cast.to_i64_vec(), vec![7, -3]);
    }
}
