//! Dense host kernels shared by the reference engine and interpreter.
//!
//! Every kernel widens to `f64`, computes, and rounds back into the requested
//! dtype through [`HostTensor::from_f64_values`].

use statrs::function::erf::erf;
use thiserror::Error;

use splice::ir::{DType, HostTensor};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct KernelError(pub String);

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        KernelError(message.into())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

pub fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize], coords: &mut [usize]) {
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
}

fn build(dtype: DType, dims: Vec<usize>, values: &[f64]) -> KernelResult<HostTensor> {
    HostTensor::from_f64_values(dtype, dims, values).map_err(|err| KernelError::new(err.to_string()))
}

/// Wraps a negative axis and checks it against `rank`.
pub fn resolve_axis(axis: i64, rank: usize) -> KernelResult<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank.max(1) as i64 {
        return Err(KernelError::new(format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(resolved as usize)
}

/// Result dtype of a binary op between two tensors.
pub fn promote(lhs: DType, rhs: DType) -> DType {
    fn float_rank(dtype: DType) -> u8 {
        match dtype {
            DType::F16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
            _ => 0,
        }
    }
    fn int_rank(dtype: DType) -> u8 {
        match dtype {
            DType::Bool => 0,
            DType::I8 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            _ => 0,
        }
    }
    if lhs == rhs {
        return lhs;
    }
    match (lhs.is_float(), rhs.is_float()) {
        (true, true) => {
            if float_rank(lhs) >= float_rank(rhs) {
                lhs
            } else {
                rhs
            }
        }
        (true, false) => lhs,
        (false, true) => rhs,
        (false, false) => {
            if int_rank(lhs) >= int_rank(rhs) {
                lhs
            } else {
                rhs
            }
        }
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> KernelResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for axis in 0..rank {
        let a = axis_from_end(lhs, rank - 1 - axis);
        let b = axis_from_end(rhs, rank - 1 - axis);
        out[axis] = match (a, b) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(KernelError::new(format!(
                    "shapes {lhs:?} and {rhs:?} do not broadcast (axis {axis}: {a} vs {b})"
                )))
            }
        };
    }
    Ok(out)
}

fn axis_from_end(dims: &[usize], from_end: usize) -> usize {
    if from_end < dims.len() {
        dims[dims.len() - 1 - from_end]
    } else {
        1
    }
}

/// Strides of `dims` aligned to a broadcast result of rank `rank`; broadcast
/// axes get stride zero.
fn broadcast_strides(dims: &[usize], rank: usize) -> Vec<usize> {
    let strides = compute_strides(dims);
    let offset = rank - dims.len();
    (0..rank)
        .map(|axis| {
            if axis < offset || dims[axis - offset] == 1 {
                0
            } else {
                strides[axis - offset]
            }
        })
        .collect()
}

/// Gathers `values` laid out as `dims` into the broadcast shape `out_dims`.
pub fn broadcast_values(values: &[f64], dims: &[usize], out_dims: &[usize]) -> Vec<f64> {
    if dims == out_dims {
        return values.to_vec();
    }
    let strides = broadcast_strides(dims, out_dims.len());
    let count: usize = out_dims.iter().product();
    let mut coords = vec![0; out_dims.len()];
    (0..count)
        .map(|index| {
            unravel_index(index, out_dims, &mut coords);
            let source: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
            values[source]
        })
        .collect()
}

pub fn map(input: &HostTensor, dtype: DType, f: impl Fn(f64) -> f64) -> KernelResult<HostTensor> {
    let values: Vec<f64> = input.to_f64_vec().into_iter().map(f).collect();
    build(dtype, input.dims().to_vec(), &values)
}

pub fn binary(
    lhs: &HostTensor,
    rhs: &HostTensor,
    dtype: DType,
    f: impl Fn(f64, f64) -> f64,
) -> KernelResult<HostTensor> {
    let dims = broadcast_shape(lhs.dims(), rhs.dims())?;
    let a = broadcast_values(&lhs.to_f64_vec(), lhs.dims(), &dims);
    let b = broadcast_values(&rhs.to_f64_vec(), rhs.dims(), &dims);
    let values: Vec<f64> = a.iter().zip(&b).map(|(x, y)| f(*x, *y)).collect();
    build(dtype, dims, &values)
}

/// Elementwise binary op with one side given as a scalar.
pub fn binary_scalar(
    lhs: &HostTensor,
    rhs: f64,
    dtype: DType,
    f: impl Fn(f64, f64) -> f64,
) -> KernelResult<HostTensor> {
    map(lhs, dtype, |x| f(x, rhs))
}

pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn leaky_relu(x: f64, slope: f64) -> f64 {
    if x >= 0.0 {
        x
    } else {
        slope * x
    }
}

pub fn elu(x: f64, alpha: f64, scale: f64, input_scale: f64) -> f64 {
    if x > 0.0 {
        scale * x
    } else {
        scale * alpha * ((x * input_scale).exp() - 1.0)
    }
}

pub fn gelu_exact(x: f64) -> f64 {
    0.5 * x * (1.0 + erf(x * std::f64::consts::FRAC_1_SQRT_2))
}

pub fn gelu_tanh(x: f64) -> f64 {
    let inner = std::f64::consts::FRAC_2_PI.sqrt() * (x + 0.044715 * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

pub fn erf_value(x: f64) -> f64 {
    erf(x)
}

/// `x` where positive, `slope * x` elsewhere; a rank-1 slope with more than
/// one element runs along axis 1.
pub fn prelu(input: &HostTensor, slope: &HostTensor) -> KernelResult<HostTensor> {
    let slopes = slope.to_f64_vec();
    let values = input.to_f64_vec();
    let dims = input.dims();
    let out: Vec<f64> = if slopes.len() == 1 {
        values.iter().map(|x| leaky_relu(*x, slopes[0])).collect()
    } else {
        if dims.len() < 2 || dims[1] != slopes.len() {
            return Err(KernelError::new(format!(
                "prelu slope of {} elements does not match channel axis of {dims:?}",
                slopes.len()
            )));
        }
        let inner: usize = dims[2..].iter().product();
        values
            .iter()
            .enumerate()
            .map(|(index, x)| leaky_relu(*x, slopes[(index / inner) % dims[1]]))
            .collect()
    };
    build(input.dtype(), dims.to_vec(), &out)
}

/// Batched matmul with numpy rules: rank-1 operands gain a unit axis that is
/// dropped again from the result, and batch axes broadcast.
pub fn matmul(lhs: &HostTensor, rhs: &HostTensor) -> KernelResult<HostTensor> {
    if lhs.rank() == 0 || rhs.rank() == 0 {
        return Err(KernelError::new("matmul operands must have rank >= 1"));
    }
    let mut a_dims = lhs.dims().to_vec();
    let mut b_dims = rhs.dims().to_vec();
    let squeeze_rows = a_dims.len() == 1;
    let squeeze_cols = b_dims.len() == 1;
    if squeeze_rows {
        a_dims.insert(0, 1);
    }
    if squeeze_cols {
        b_dims.push(1);
    }
    let (m, k) = (a_dims[a_dims.len() - 2], a_dims[a_dims.len() - 1]);
    let (k2, n) = (b_dims[b_dims.len() - 2], b_dims[b_dims.len() - 1]);
    if k != k2 {
        return Err(KernelError::new(format!(
            "matmul inner dimensions differ: {:?} x {:?}",
            lhs.dims(),
            rhs.dims()
        )));
    }
    let batch = broadcast_shape(&a_dims[..a_dims.len() - 2], &b_dims[..b_dims.len() - 2])?;
    let a_full: Vec<usize> = batch.iter().copied().chain([m, k]).collect();
    let b_full: Vec<usize> = batch.iter().copied().chain([k, n]).collect();
    let a = broadcast_values(&lhs.to_f64_vec(), &a_dims, &a_full);
    let b = broadcast_values(&rhs.to_f64_vec(), &b_dims, &b_full);

    let batches: usize = batch.iter().product();
    let mut out = vec![0.0; batches * m * n];
    for index in 0..batches {
        let a_block = &a[index * m * k..(index + 1) * m * k];
        let b_block = &b[index * k * n..(index + 1) * k * n];
        let o_block = &mut out[index * m * n..(index + 1) * m * n];
        for row in 0..m {
            for col in 0..n {
                let mut sum = 0.0;
                for inner in 0..k {
                    sum += a_block[row * k + inner] * b_block[inner * n + col];
                }
                o_block[row * n + col] = sum;
            }
        }
    }

    let mut dims = batch;
    if !squeeze_rows {
        dims.push(m);
    }
    if !squeeze_cols {
        dims.push(n);
    }
    build(promote(lhs.dtype(), rhs.dtype()), dims, &out)
}

pub fn permute(input: &HostTensor, perm: &[usize]) -> KernelResult<HostTensor> {
    let dims = input.dims();
    if perm.len() != dims.len() {
        return Err(KernelError::new(format!(
            "permutation {perm:?} does not match rank {}",
            dims.len()
        )));
    }
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        if axis >= perm.len() || std::mem::replace(&mut seen[axis], true) {
            return Err(KernelError::new(format!("{perm:?} is not a permutation")));
        }
    }
    let out_dims: Vec<usize> = perm.iter().map(|&axis| dims[axis]).collect();
    let in_strides = compute_strides(dims);
    let values = input.to_f64_vec();
    let mut coords = vec![0; out_dims.len()];
    let out: Vec<f64> = (0..values.len())
        .map(|index| {
            unravel_index(index, &out_dims, &mut coords);
            let source: usize = coords
                .iter()
                .zip(perm)
                .map(|(c, axis)| c * in_strides[*axis])
                .sum();
            values[source]
        })
        .collect();
    build(input.dtype(), out_dims, &out)
}

/// Resolves a reshape target against `dims`. One `-1` is inferred; with
/// `zero_copies` a `0` copies the input extent at the same position.
pub fn resolve_reshape(dims: &[usize], target: &[i64], zero_copies: bool) -> KernelResult<Vec<usize>> {
    let total: usize = dims.iter().product();
    let mut inferred = None;
    let mut out = Vec::with_capacity(target.len());
    for (axis, &extent) in target.iter().enumerate() {
        match extent {
            -1 => {
                if inferred.replace(axis).is_some() {
                    return Err(KernelError::new(format!("{target:?} infers more than one axis")));
                }
                out.push(1);
            }
            0 if zero_copies => {
                let copied = dims.get(axis).copied().ok_or_else(|| {
                    KernelError::new(format!("{target:?} copies axis {axis} of rank-{} input", dims.len()))
                })?;
                out.push(copied);
            }
            extent if extent >= 0 => out.push(extent as usize),
            extent => return Err(KernelError::new(format!("invalid extent {extent} in {target:?}"))),
        }
    }
    let known: usize = out.iter().product();
    if let Some(axis) = inferred {
        if known == 0 || total % known != 0 {
            return Err(KernelError::new(format!("cannot reshape {dims:?} into {target:?}")));
        }
        out[axis] = total / known;
    } else if known != total {
        return Err(KernelError::new(format!("cannot reshape {dims:?} into {target:?}")));
    }
    Ok(out)
}

pub fn reshape(input: &HostTensor, dims: Vec<usize>) -> KernelResult<HostTensor> {
    input.reshape(dims).map_err(|err| KernelError::new(err.to_string()))
}

/// Pads each axis by `pre`/`post` elements of `value`; negative amounts crop.
pub fn pad(input: &HostTensor, pre: &[i64], post: &[i64], value: f64) -> KernelResult<HostTensor> {
    let dims = input.dims();
    if pre.len() != dims.len() || post.len() != dims.len() {
        return Err(KernelError::new(format!(
            "padding of {} / {} axes for rank {}",
            pre.len(),
            post.len(),
            dims.len()
        )));
    }
    let mut out_dims = Vec::with_capacity(dims.len());
    for axis in 0..dims.len() {
        let extent = dims[axis] as i64 + pre[axis] + post[axis];
        if extent < 0 {
            return Err(KernelError::new(format!("padding crops axis {axis} below zero")));
        }
        out_dims.push(extent as usize);
    }
    let values = input.to_f64_vec();
    let in_strides = compute_strides(dims);
    let count: usize = out_dims.iter().product();
    let mut coords = vec![0; out_dims.len()];
    let out: Vec<f64> = (0..count)
        .map(|index| {
            unravel_index(index, &out_dims, &mut coords);
            let mut source = 0usize;
            for axis in 0..dims.len() {
                let at = coords[axis] as i64 - pre[axis];
                if at < 0 || at >= dims[axis] as i64 {
                    return value;
                }
                source += at as usize * in_strides[axis];
            }
            values[source]
        })
        .collect();
    build(input.dtype(), out_dims, &out)
}

/// Visits every lane along `axis`: `f` receives the flat indices of one lane.
fn for_each_lane(dims: &[usize], axis: usize, mut f: impl FnMut(&[usize])) {
    let extent = dims[axis];
    let inner: usize = dims[axis + 1..].iter().product();
    let outer: usize = dims[..axis].iter().product();
    let mut lane = Vec::with_capacity(extent);
    for o in 0..outer {
        for i in 0..inner {
            lane.clear();
            lane.extend((0..extent).map(|a| (o * extent + a) * inner + i));
            f(&lane);
        }
    }
}

pub fn softmax(input: &HostTensor, axis: usize, dtype: DType) -> KernelResult<HostTensor> {
    let dims = input.dims();
    if input.rank() == 0 {
        return build(dtype, Vec::new(), &[1.0]);
    }
    if axis >= dims.len() {
        return Err(KernelError::new(format!("softmax axis {axis} out of range for {dims:?}")));
    }
    let values = input.to_f64_vec();
    let mut out = vec![0.0; values.len()];
    for_each_lane(dims, axis, |lane| {
        let max = lane.iter().map(|&i| values[i]).fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = lane.iter().map(|&i| (values[i] - max).exp()).sum();
        for &i in lane {
            out[i] = (values[i] - max).exp() / sum;
        }
    });
    build(dtype, dims.to_vec(), &out)
}

pub fn cumsum(input: &HostTensor, axis: usize, dtype: DType) -> KernelResult<HostTensor> {
    let dims = input.dims();
    let values = input.to_f64_vec();
    if input.rank() == 0 {
        return build(dtype, Vec::new(), &values);
    }
    if axis >= dims.len() {
        return Err(KernelError::new(format!("cumsum axis {axis} out of range for {dims:?}")));
    }
    let mut out = vec![0.0; values.len()];
    for_each_lane(dims, axis, |lane| {
        let mut acc = 0.0;
        for &i in lane {
            acc += values[i];
            out[i] = acc;
        }
    });
    build(dtype, dims.to_vec(), &out)
}

/// Sums (or averages) over `axes`; with `keep_dims` reduced axes stay as 1.
pub fn reduce(
    input: &HostTensor,
    axes: &[usize],
    keep_dims: bool,
    mean: bool,
    dtype: DType,
) -> KernelResult<HostTensor> {
    let dims = input.dims();
    if let Some(axis) = axes.iter().find(|&&axis| axis >= dims.len().max(1)) {
        return Err(KernelError::new(format!("reduce axis {axis} out of range for {dims:?}")));
    }
    let reduced = |axis: usize| axes.contains(&axis);
    let kept_dims: Vec<usize> = (0..dims.len())
        .map(|axis| if reduced(axis) { 1 } else { dims[axis] })
        .collect();
    let kept_strides = compute_strides(&kept_dims);
    let mut sums = vec![0.0; kept_dims.iter().product()];
    let values = input.to_f64_vec();
    let mut coords = vec![0; dims.len()];
    for (index, value) in values.iter().enumerate() {
        unravel_index(index, dims, &mut coords);
        let target: usize = coords
            .iter()
            .enumerate()
            .map(|(axis, c)| if reduced(axis) { 0 } else { c * kept_strides[axis] })
            .sum();
        sums[target] += value;
    }
    if mean {
        let count: usize = axes.iter().filter_map(|&axis| dims.get(axis)).product();
        for sum in &mut sums {
            *sum /= count as f64;
        }
    }
    let out_dims = if keep_dims {
        kept_dims
    } else {
        (0..dims.len())
            .filter(|axis| !reduced(*axis))
            .map(|axis| dims[axis])
            .collect()
    };
    build(dtype, out_dims, &sums)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_follows_trailing_axes() {
        assert_eq!(broadcast_shape(&[2, 1, 4], &[3, 1]).expect("broadcast"), vec![2, 3, 4]);
        assert!(broadcast_shape(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn reshape_infers_and_copies() {
        assert_eq!(resolve_reshape(&[2, 3, 4], &[0, -1], true).expect("reshape"), vec![2, 12]);
        assert_eq!(resolve_reshape(&[2, 3, 4], &[-1], false).expect("reshape"), vec![24]);
        assert!(resolve_reshape(&[2, 3], &[-1, -1], false).is_err());
    }

    #[test]
    fn pad_crops_on_negative_amounts() {
        let x = HostTensor::from_f32(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]).expect("tensor");
        let out = pad(&x, &[0, -1], &[0, 2], 9.0).expect("pad");
        assert_eq!(out.dims(), &[1, 5]);
        assert_eq!(out.to_f32_vec(), vec![2.0, 3.0, 4.0, 9.0, 9.0]);
    }

    #[test]
    fn matmul_drops_vector_axes() {
        let a = HostTensor::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("tensor");
        let v = HostTensor::from_f32(vec![3], vec![1.0, 0.0, -1.0]).expect("tensor");
        let out = matmul(&a, &v).expect("matmul");
        assert_eq!(out.dims(), &[2]);
        assert_eq!(out.to_f32_vec(), vec![-2.0, -2.0]);
    }

    #[test]
    fn mean_without_keepdim_removes_axes() {
        let x = HostTensor::from_f32(vec![2, 2], vec![1.0, 3.0, 5.0, 7.0]).expect("tensor");
        let out = reduce(&x, &[1], false, true, DType::F32).expect("reduce");
        assert_eq!(out.dims(), &[2]);
        assert_eq!(out.to_f32_vec(), vec![2.0, 6.0]);
    }
}
