#![forbid(unsafe_code)]

use std::fmt;

use gp_core::{DType, DenseTensor, TensorError, contiguous_strides};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    Tensor(TensorError),
    DTypeMismatch {
        lhs: DType,
        rhs: DType,
    },
    InvalidDim {
        op: &'static str,
        dim: usize,
        rank: usize,
    },
    DuplicateDim {
        op: &'static str,
        dim: usize,
    },
    InvalidRank {
        op: &'static str,
        rank: usize,
        expected: &'static str,
    },
    PadRankExceeded {
        pairs: usize,
        rank: usize,
    },
    EmptyReduction {
        dim: usize,
    },
    ParameterShape {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    InvalidProbability {
        p: f64,
    },
    InvalidOutputSize {
        op: &'static str,
        size: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(error) => write!(f, "tensor error: {error}"),
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::InvalidDim { op, dim, rank } => {
                write!(f, "{op}: dim {dim} out of range for rank {rank}")
            }
            Self::DuplicateDim { op, dim } => write!(f, "{op}: dim {dim} listed twice"),
            Self::InvalidRank { op, rank, expected } => {
                write!(f, "{op}: rank {rank} unsupported, expected {expected}")
            }
            Self::PadRankExceeded { pairs, rank } => {
                write!(f, "constant_pad: {pairs} pad pairs exceed input rank {rank}")
            }
            Self::EmptyReduction { dim } => {
                write!(f, "amin: cannot reduce over empty dim {dim}")
            }
            Self::ParameterShape {
                op,
                expected,
                actual,
            } => write!(
                f,
                "{op}: parameter has {actual} elements, expected 1 or {expected}"
            ),
            Self::InvalidProbability { p } => {
                write!(f, "dropout: probability {p} outside [0, 1)")
            }
            Self::InvalidOutputSize { op, size } => {
                write!(f, "{op}: output size {size} must be positive")
            }
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorError> for KernelError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

fn map_elementwise<F>(input: &DenseTensor, op: F) -> Result<DenseTensor, KernelError>
where
    F: Fn(f64) -> f64,
{
    let data = input.values().iter().map(|value| op(*value)).collect();
    Ok(DenseTensor::new(
        input.shape().to_vec(),
        input.dtype(),
        data,
    )?)
}

pub fn mul_scalar(input: &DenseTensor, factor: f64) -> Result<DenseTensor, KernelError> {
    map_elementwise(input, |value| value * factor)
}

pub fn add_scalar(input: &DenseTensor, offset: f64) -> Result<DenseTensor, KernelError> {
    map_elementwise(input, |value| value + offset)
}

/// Pads trailing dimensions with a constant.
///
/// `pads[0]` applies to the last dimension, `pads[1]` to the one before it,
/// and so on; each pair is `(before, after)`.
pub fn constant_pad(
    input: &DenseTensor,
    pads: &[(usize, usize)],
    value: f64,
) -> Result<DenseTensor, KernelError> {
    let rank = input.shape().len();
    if pads.len() > rank {
        return Err(KernelError::PadRankExceeded {
            pairs: pads.len(),
            rank,
        });
    }

    let mut before = vec![0usize; rank];
    let mut out_shape = input.shape().to_vec();
    for (offset, (lead, trail)) in pads.iter().copied().enumerate() {
        let dim = rank - 1 - offset;
        before[dim] = lead;
        out_shape[dim] = out_shape[dim] + lead + trail;
    }

    let out_strides = contiguous_strides(&out_shape);
    let out_numel: usize = out_shape.iter().product();
    let mut data = vec![input.dtype().round(value); out_numel];

    let in_shape = input.shape();
    let mut index = vec![0usize; rank];
    for src in input.values() {
        let mut dst = 0usize;
        for dim in 0..rank {
            dst += (index[dim] + before[dim]) * out_strides[dim];
        }
        data[dst] = *src;
        advance_index(&mut index, in_shape);
    }

    Ok(DenseTensor::new(out_shape, input.dtype(), data)?)
}

/// Minimum over `dims`; an empty `dims` reduces every dimension.
pub fn amin(input: &DenseTensor, dims: &[usize], keepdim: bool) -> Result<DenseTensor, KernelError> {
    let rank = input.shape().len();
    let reduce = normalize_dims("amin", dims, rank)?;
    for (dim, reduced) in reduce.iter().copied().enumerate() {
        if reduced && input.shape()[dim] == 0 {
            return Err(KernelError::EmptyReduction { dim });
        }
    }

    let kept_shape: Vec<usize> = input
        .shape()
        .iter()
        .enumerate()
        .map(|(dim, size)| if reduce[dim] { 1 } else { *size })
        .collect();
    let kept_strides = contiguous_strides(&kept_shape);
    let kept_numel: usize = kept_shape.iter().product();
    let mut data = vec![f64::INFINITY; kept_numel];
    let mut saw_nan = vec![false; kept_numel];

    let mut index = vec![0usize; rank];
    for value in input.values() {
        let mut dst = 0usize;
        for dim in 0..rank {
            if !reduce[dim] {
                dst += index[dim] * kept_strides[dim];
            }
        }
        if value.is_nan() {
            saw_nan[dst] = true;
        } else if *value < data[dst] {
            data[dst] = *value;
        }
        advance_index(&mut index, input.shape());
    }
    for (slot, nan) in data.iter_mut().zip(saw_nan) {
        if nan {
            *slot = f64::NAN;
        }
    }

    let out_shape = if keepdim {
        kept_shape
    } else {
        input
            .shape()
            .iter()
            .enumerate()
            .filter(|(dim, _)| !reduce[*dim])
            .map(|(_, size)| *size)
            .collect()
    };
    Ok(DenseTensor::new(out_shape, input.dtype(), data)?)
}

/// Output shape of `prelu`. Slopes are per channel along dim 1, or a single
/// shared slope. Inputs below rank 2 have no channel dim and take only a
/// shared slope.
pub fn prelu_shape(input: &[usize], weight: &[usize]) -> Result<Vec<usize>, KernelError> {
    if input.is_empty() {
        return Err(KernelError::InvalidRank {
            op: "prelu",
            rank: 0,
            expected: ">= 1",
        });
    }
    let channels = if input.len() >= 2 { input[1] } else { 1 };
    let slopes: usize = weight.iter().product();
    if slopes != 1 && slopes != channels {
        return Err(KernelError::ParameterShape {
            op: "prelu",
            expected: channels,
            actual: slopes,
        });
    }
    Ok(input.to_vec())
}

pub fn prelu(input: &DenseTensor, weight: &DenseTensor) -> Result<DenseTensor, KernelError> {
    if input.dtype() != weight.dtype() {
        return Err(KernelError::DTypeMismatch {
            lhs: input.dtype(),
            rhs: weight.dtype(),
        });
    }
    let shape = prelu_shape(input.shape(), weight.shape())?;
    let slopes = weight.values();
    if let [slope] = slopes {
        let data = input
            .values()
            .iter()
            .map(|value| if *value >= 0.0 { *value } else { slope * value })
            .collect();
        return Ok(DenseTensor::new(shape, input.dtype(), data)?);
    }

    let channels = shape[1];
    let inner: usize = shape[2..].iter().product();
    let data = input
        .values()
        .iter()
        .enumerate()
        .map(|(flat, value)| {
            let slope = slopes[(flat / inner) % channels];
            if *value >= 0.0 { *value } else { slope * value }
        })
        .collect();
    Ok(DenseTensor::new(shape, input.dtype(), data)?)
}

/// Cumulative product along `dim`, rounding after every step.
pub fn cumprod(input: &DenseTensor, dim: usize) -> Result<DenseTensor, KernelError> {
    let shape = input.shape();
    if dim >= shape.len() {
        return Err(KernelError::InvalidDim {
            op: "cumprod",
            dim,
            rank: shape.len(),
        });
    }
    let dtype = input.dtype();
    let size = shape[dim];
    let inner: usize = shape[dim + 1..].iter().product();
    let outer: usize = shape[..dim].iter().product();
    let mut data = input.values().to_vec();
    for o in 0..outer {
        for i in 0..inner {
            let base = o * size * inner + i;
            let mut running = 1.0f64;
            for k in 0..size {
                let at = base + k * inner;
                running = dtype.round(running * data[at]);
                data[at] = running;
            }
        }
    }
    Ok(DenseTensor::new(shape.to_vec(), dtype, data)?)
}

/// Adaptive average pooling over the two trailing dimensions. `None` keeps
/// the input extent of that dimension.
pub fn adaptive_avg_pool2d(
    input: &DenseTensor,
    output_size: [Option<usize>; 2],
) -> Result<DenseTensor, KernelError> {
    let shape = input.shape();
    let rank = shape.len();
    if rank != 3 && rank != 4 {
        return Err(KernelError::InvalidRank {
            op: "adaptive_avg_pool2d",
            rank,
            expected: "3 or 4",
        });
    }
    let in_h = shape[rank - 2];
    let in_w = shape[rank - 1];
    let out_h = output_size[0].unwrap_or(in_h);
    let out_w = output_size[1].unwrap_or(in_w);
    for size in [out_h, out_w] {
        if size == 0 {
            return Err(KernelError::InvalidOutputSize {
                op: "adaptive_avg_pool2d",
                size,
            });
        }
    }

    let planes: usize = shape[..rank - 2].iter().product();
    let dtype = input.dtype();
    let values = input.values();
    let mut data = Vec::with_capacity(planes * out_h * out_w);
    for plane in 0..planes {
        let plane_base = plane * in_h * in_w;
        for oh in 0..out_h {
            let (h0, h1) = adaptive_window(oh, in_h, out_h);
            for ow in 0..out_w {
                let (w0, w1) = adaptive_window(ow, in_w, out_w);
                let mut sum = 0.0f64;
                for h in h0..h1 {
                    for w in w0..w1 {
                        sum += values[plane_base + h * in_w + w];
                    }
                }
                let count = ((h1 - h0) * (w1 - w0)) as f64;
                data.push(dtype.round(sum / count));
            }
        }
    }

    let mut out_shape = shape[..rank - 2].to_vec();
    out_shape.push(out_h);
    out_shape.push(out_w);
    Ok(DenseTensor::new(out_shape, dtype, data)?)
}

fn adaptive_window(index: usize, input: usize, output: usize) -> (usize, usize) {
    let start = (index * input) / output;
    let end = ((index + 1) * input).div_ceil(output);
    (start, end)
}

/// Training-mode dropout: zeroes elements with probability `p` and rescales
/// survivors by `1 / (1 - p)`. Eval-mode dropout never reaches this kernel.
pub fn dropout_train<R>(input: &DenseTensor, p: f64, rng: &mut R) -> Result<DenseTensor, KernelError>
where
    R: Rng + ?Sized,
{
    validate_dropout_probability(p)?;
    if p == 0.0 {
        return Ok(input.clone());
    }
    let scale = 1.0 / (1.0 - p);
    let data = input
        .values()
        .iter()
        .map(|value| {
            if rng.gen_bool(p) { 0.0 } else { value * scale }
        })
        .collect();
    Ok(DenseTensor::new(
        input.shape().to_vec(),
        input.dtype(),
        data,
    )?)
}

pub fn validate_dropout_probability(p: f64) -> Result<(), KernelError> {
    if !(0.0..1.0).contains(&p) {
        return Err(KernelError::InvalidProbability { p });
    }
    Ok(())
}

/// Mean over every element, accumulated in f64.
#[must_use]
pub fn mean_all(input: &DenseTensor) -> f64 {
    if input.numel() == 0 {
        return f64::NAN;
    }
    input.values().iter().sum::<f64>() / input.numel() as f64
}

/// Output shape of `amin` without touching data.
pub fn amin_shape(shape: &[usize], dims: &[usize], keepdim: bool) -> Result<Vec<usize>, KernelError> {
    let reduce = normalize_dims("amin", dims, shape.len())?;
    Ok(shape
        .iter()
        .enumerate()
        .filter_map(|(dim, size)| match (reduce[dim], keepdim) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(*size),
        })
        .collect())
}

/// Output shape of `constant_pad` without touching data.
pub fn constant_pad_shape(shape: &[usize], pads: &[(usize, usize)]) -> Result<Vec<usize>, KernelError> {
    let rank = shape.len();
    if pads.len() > rank {
        return Err(KernelError::PadRankExceeded {
            pairs: pads.len(),
            rank,
        });
    }
    let mut out = shape.to_vec();
    for (offset, (lead, trail)) in pads.iter().copied().enumerate() {
        out[rank - 1 - offset] += lead + trail;
    }
    Ok(out)
}

/// Output shape of `adaptive_avg_pool2d` without touching data.
pub fn adaptive_avg_pool2d_shape(
    shape: &[usize],
    output_size: [Option<usize>; 2],
) -> Result<Vec<usize>, KernelError> {
    let rank = shape.len();
    if rank != 3 && rank != 4 {
        return Err(KernelError::InvalidRank {
            op: "adaptive_avg_pool2d",
            rank,
            expected: "3 or 4",
        });
    }
    let mut out = shape[..rank - 2].to_vec();
    for (slot, size) in output_size.iter().zip(&shape[rank - 2..]) {
        let resolved = slot.unwrap_or(*size);
        if resolved == 0 {
            return Err(KernelError::InvalidOutputSize {
                op: "adaptive_avg_pool2d",
                size: resolved,
            });
        }
        out.push(resolved);
    }
    Ok(out)
}

fn normalize_dims(op: &'static str, dims: &[usize], rank: usize) -> Result<Vec<bool>, KernelError> {
    if dims.is_empty() {
        return Ok(vec![true; rank]);
    }
    let mut reduce = vec![false; rank];
    for dim in dims.iter().copied() {
        if dim >= rank {
            return Err(KernelError::InvalidDim { op, dim, rank });
        }
        if reduce[dim] {
            return Err(KernelError::DuplicateDim { op, dim });
        }
        reduce[dim] = true;
    }
    Ok(reduce)
}

fn advance_index(index: &mut [usize], shape: &[usize]) {
    for dim in (0..shape.len()).rev() {
        index[dim] += 1;
        if index[dim] < shape[dim] {
            return;
        }
        index[dim] = 0;
    }
}
