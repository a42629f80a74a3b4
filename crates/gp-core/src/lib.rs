#![forbid(unsafe_code)]

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Rounds a value into the representable set of this dtype.
    #[must_use]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::F32 => f64::from(value as f32),
            Self::F64 => value,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/// Evaluation mode of a graph definition.
///
/// `Eval` disables every stochastic or mode-dependent behavior. The harness
/// only ever evaluates in `Eval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    Eval,
    Train,
}

#[must_use]
pub fn eval_mode_label(mode: EvalMode) -> &'static str {
    match mode {
        EvalMode::Eval => "eval",
        EvalMode::Train => "train",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    dtype: DType,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    /// Rejects shapes whose element count does not fit in `usize`.
    pub fn validate(&self) -> Result<(), TensorError> {
        self.shape
            .iter()
            .try_fold(1usize, |count, size| count.checked_mul(*size))
            .map(|_| ())
            .ok_or_else(|| TensorError::ElementCountOverflow {
                shape: self.shape.clone(),
            })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut parts = Vec::with_capacity(self.shape.len() + 2);
        parts.push(self.shape.len() as u64);
        parts.extend(self.shape.iter().map(|dim| *dim as u64));
        parts.push(match self.dtype {
            DType::F32 => 1,
            DType::F64 => 2,
        });
        sha256_u64s(&parts)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    ElementCountOverflow {
        shape: Vec<usize>,
    },
    StorageLengthMismatch {
        expected: usize,
        actual: usize,
    },
    EmptyInputShape,
    ZeroDimension {
        dim: usize,
    },
    InvalidGenerationRule {
        reason: String,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementCountOverflow { shape } => {
                write!(f, "element count overflows usize for shape {shape:?}")
            }
            Self::StorageLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "storage length mismatch: expected={expected}, actual={actual}"
                )
            }
            Self::EmptyInputShape => write!(f, "input shape must have at least one dimension"),
            Self::ZeroDimension { dim } => {
                write!(f, "input shape dimension {dim} must be positive")
            }
            Self::InvalidGenerationRule { reason } => {
                write!(f, "invalid generation rule: {reason}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Contiguous dense tensor. Storage always holds values already rounded to
/// the tensor dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorWire", into = "TensorWire")]
pub struct DenseTensor {
    meta: TensorMeta,
    data: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TensorWire {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<f64>,
}

impl TryFrom<TensorWire> for DenseTensor {
    type Error = TensorError;

    fn try_from(wire: TensorWire) -> Result<Self, Self::Error> {
        Self::new(wire.shape, wire.dtype, wire.data)
    }
}

impl From<DenseTensor> for TensorWire {
    fn from(tensor: DenseTensor) -> Self {
        Self {
            shape: tensor.meta.shape,
            dtype: tensor.meta.dtype,
            data: tensor.data,
        }
    }
}

impl DenseTensor {
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<f64>) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape, dtype);
        meta.validate()?;
        if data.len() != meta.numel() {
            return Err(TensorError::StorageLengthMismatch {
                expected: meta.numel(),
                actual: data.len(),
            });
        }
        let data = data.into_iter().map(|value| dtype.round(value)).collect();
        Ok(Self { meta, data })
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, dtype: DType, value: f64) -> Self {
        let meta = TensorMeta::from_shape(shape, dtype);
        let data = vec![dtype.round(value); meta.numel()];
        Self { meta, data }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Bit-level digest over shape, dtype and values.
    #[must_use]
    pub fn digest64(&self) -> u64 {
        let mut parts = Vec::with_capacity(self.data.len() + 1);
        parts.push(self.meta.fingerprint64());
        parts.extend(self.data.iter().map(|value| value.to_bits()));
        sha256_u64s(&parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum GenerationRule {
    /// Uniform in `[0, 1)`.
    Uniform01,
    Uniform { low: f64, high: f64 },
    Constant { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub rule: GenerationRule,
}

impl InputSpec {
    #[must_use]
    pub fn uniform01(shape: Vec<usize>) -> Self {
        Self {
            shape,
            dtype: DType::F32,
            rule: GenerationRule::Uniform01,
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: GenerationRule) -> Self {
        self.rule = rule;
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn validate(&self) -> Result<(), TensorError> {
        if self.shape.is_empty() {
            return Err(TensorError::EmptyInputShape);
        }
        if let Some(dim) = self.shape.iter().position(|size| *size == 0) {
            return Err(TensorError::ZeroDimension { dim });
        }
        if let GenerationRule::Uniform { low, high } = self.rule
            && !(low.is_finite() && high.is_finite() && low < high)
        {
            return Err(TensorError::InvalidGenerationRule {
                reason: format!("uniform bounds must be finite with low < high: [{low}, {high})"),
            });
        }
        if let GenerationRule::Constant { value } = self.rule
            && !value.is_finite()
        {
            return Err(TensorError::InvalidGenerationRule {
                reason: format!("constant value must be finite: {value}"),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }
}

/// Scoped deterministic value source for one case.
///
/// Inputs are drawn in declaration order from a single stream, so the same
/// seed and spec list always yield byte-identical tensors.
#[derive(Debug, Clone)]
pub struct SeededGenerator {
    rng: ChaCha8Rng,
}

impl SeededGenerator {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self, spec: &InputSpec) -> Result<DenseTensor, TensorError> {
        spec.validate()?;
        let count = spec.numel();
        let mut data = Vec::with_capacity(count);
        match spec.rule {
            GenerationRule::Uniform01 => match spec.dtype {
                DType::F32 => data.extend((0..count).map(|_| f64::from(self.rng.r#gen::<f32>()))),
                DType::F64 => data.extend((0..count).map(|_| self.rng.r#gen::<f64>())),
            },
            GenerationRule::Uniform { low, high } => {
                data.extend((0..count).map(|_| self.rng.gen_range(low..high)));
            }
            GenerationRule::Constant { value } => data.resize(count, value),
        }
        DenseTensor::new(spec.shape.clone(), spec.dtype, data)
    }

    pub fn generate_all(&mut self, specs: &[InputSpec]) -> Result<Vec<DenseTensor>, TensorError> {
        specs.iter().map(|spec| self.generate(spec)).collect()
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 truncated to its leading eight bytes.
#[must_use]
pub fn sha256_u64(bytes: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    truncate_digest(&hasher.finalize())
}

/// Truncated SHA-256 over the little-endian bytes of each part.
#[must_use]
pub fn sha256_u64s(parts: &[u64]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.to_le_bytes());
    }
    truncate_digest(&hasher.finalize())
}

fn truncate_digest(digest: &[u8]) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[must_use]
pub fn sha256_label(digest: u64) -> String {
    format!("sha256:{digest:016x}")
}
