#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use gp_core::{DType, DenseTensor, EvalMode, TensorError};
use gp_kernel_cpu::{
    KernelError, adaptive_avg_pool2d, adaptive_avg_pool2d_shape, add_scalar, amin, amin_shape,
    constant_pad, constant_pad_shape, cumprod, dropout_train, mean_all, mul_scalar, prelu,
    prelu_shape, validate_dropout_probability,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Lowest declarative format version the harness can negotiate.
pub const MIN_FORMAT_VERSION: u32 = 9;
/// Highest declarative format version the harness knows about.
pub const MAX_FORMAT_VERSION: u32 = 17;
pub const DEFAULT_FORMAT_VERSION: u32 = 13;
/// Adaptive pooling with a kept (unspecified) output extent needs this version.
pub const PARTIAL_ADAPTIVE_POOL_MIN_VERSION: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Op {
    Input { index: usize },
    Parameter { name: String },
    MulScalar { factor: f64 },
    AddScalar { offset: f64 },
    ConstantPad { pads: Vec<(usize, usize)>, value: f64 },
    Amin { dims: Vec<usize>, keepdim: bool },
    Prelu,
    Cumprod { dim: usize },
    AdaptiveAvgPool2d { output_size: [Option<usize>; 2] },
    Dropout { p: f64, train: bool },
}

impl Op {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Parameter { .. } => "parameter",
            Self::MulScalar { .. } => "mul_scalar",
            Self::AddScalar { .. } => "add_scalar",
            Self::ConstantPad { .. } => "constant_pad",
            Self::Amin { .. } => "amin",
            Self::Prelu => "prelu",
            Self::Cumprod { .. } => "cumprod",
            Self::AdaptiveAvgPool2d { .. } => "adaptive_avg_pool2d",
            Self::Dropout { .. } => "dropout",
        }
    }

    /// Minimum declarative format version in which this op variant is defined.
    #[must_use]
    pub fn min_format_version(&self) -> u32 {
        match self {
            Self::AdaptiveAvgPool2d { output_size } if output_size.iter().any(Option::is_none) => {
                PARTIAL_ADAPTIVE_POOL_MIN_VERSION
            }
            _ => MIN_FORMAT_VERSION,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Self::Input { .. } | Self::Parameter { .. } => 0,
            Self::Prelu => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Flat, topologically ordered graph. Every node defines exactly one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub outputs: Vec<ValueId>,
    #[serde(default)]
    pub params: BTreeMap<String, DenseTensor>,
}

impl Graph {
    /// Declared inputs as `(shape, dtype)`, ordered by input index.
    #[must_use]
    pub fn input_decls(&self) -> Vec<(Vec<usize>, DType)> {
        let mut inputs: Vec<(usize, Vec<usize>, DType)> = self
            .nodes
            .iter()
            .filter_map(|node| match node.op {
                Op::Input { index } => Some((index, node.shape.clone(), node.dtype)),
                _ => None,
            })
            .collect();
        inputs.sort_by_key(|(index, _, _)| *index);
        inputs
            .into_iter()
            .map(|(_, shape, dtype)| (shape, dtype))
            .collect()
    }

    #[must_use]
    pub fn output_shapes(&self) -> Vec<Vec<usize>> {
        self.outputs
            .iter()
            .filter_map(|id| self.node_for(*id).map(|node| node.shape.clone()))
            .collect()
    }

    #[must_use]
    pub fn node_for(&self, id: ValueId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.output == id)
    }

    /// Distinct op kinds, excluding inputs and parameters.
    #[must_use]
    pub fn op_kinds(&self) -> BTreeSet<&'static str> {
        self.nodes
            .iter()
            .filter(|node| node.op.arity() > 0)
            .map(|node| node.op.kind())
            .collect()
    }

    /// Drops nodes whose values never reach an output. Inputs are always kept
    /// so the declared input arity survives.
    #[must_use]
    pub fn pruned(&self) -> Self {
        let mut live: BTreeSet<ValueId> = self.outputs.iter().copied().collect();
        for node in self.nodes.iter().rev() {
            if live.contains(&node.output) {
                live.extend(node.inputs.iter().copied());
            }
        }
        let nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|node| live.contains(&node.output) || matches!(node.op, Op::Input { .. }))
            .cloned()
            .collect();
        let referenced: BTreeSet<&str> = nodes
            .iter()
            .filter_map(|node| match &node.op {
                Op::Parameter { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        let params = self
            .params
            .iter()
            .filter(|(name, _)| referenced.contains(name.as_str()))
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect();
        Self {
            nodes,
            outputs: self.outputs.clone(),
            params,
        }
    }

    /// Checks def-before-use, arity and parameter presence.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut defined = BTreeSet::new();
        for node in &self.nodes {
            if node.inputs.len() != node.op.arity() {
                return Err(GraphError::Malformed {
                    reason: format!(
                        "{} node {} has {} inputs, expected {}",
                        node.op.kind(),
                        node.output,
                        node.inputs.len(),
                        node.op.arity()
                    ),
                });
            }
            for input in &node.inputs {
                if !defined.contains(input) {
                    return Err(GraphError::UnknownValue { id: *input });
                }
            }
            if let Op::Parameter { name } = &node.op
                && !self.params.contains_key(name)
            {
                return Err(GraphError::MissingParameter { name: name.clone() });
            }
            if !defined.insert(node.output) {
                return Err(GraphError::Malformed {
                    reason: format!("value {} defined twice", node.output),
                });
            }
        }
        for output in &self.outputs {
            if !defined.contains(output) {
                return Err(GraphError::UnknownValue { id: *output });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    Kernel(KernelError),
    Tensor(TensorError),
    UnknownValue {
        id: ValueId,
    },
    /// Concrete data was requested while building a symbolic graph.
    DataDependent {
        op: &'static str,
    },
    InputCountMismatch {
        expected: usize,
        actual: usize,
    },
    InputShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    MissingParameter {
        name: String,
    },
    ParameterConflict {
        name: String,
    },
    NonDeterministic {
        op: &'static str,
    },
    UnsupportedFormatVersion {
        requested: u32,
        min: u32,
    },
    Malformed {
        reason: String,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::UnknownValue { id } => write!(f, "unknown value {id}"),
            Self::DataDependent { op } => {
                write!(f, "{op} reads concrete tensor data; not representable symbolically")
            }
            Self::InputCountMismatch { expected, actual } => {
                write!(f, "graph expects {expected} inputs, got {actual}")
            }
            Self::InputShapeMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "input {index} shape mismatch: expected={expected:?}, actual={actual:?}"
            ),
            Self::MissingParameter { name } => write!(f, "missing parameter '{name}'"),
            Self::ParameterConflict { name } => {
                write!(f, "parameter '{name}' registered twice with different values")
            }
            Self::NonDeterministic { op } => {
                write!(f, "{op} requires a random source and cannot be replayed")
            }
            Self::UnsupportedFormatVersion { requested, min } => {
                write!(f, "format version {requested} is below the minimum {min}")
            }
            Self::Malformed { reason } => write!(f, "malformed graph: {reason}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<KernelError> for GraphError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<TensorError> for GraphError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Result of capability negotiation for the declarative format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub format_version: u32,
}

impl Capabilities {
    #[must_use]
    pub fn at_least(&self, version: u32) -> bool {
        self.format_version >= version
    }

    #[must_use]
    pub fn supports(&self, op: &Op) -> bool {
        self.at_least(op.min_format_version())
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            format_version: DEFAULT_FORMAT_VERSION,
        }
    }
}

/// Negotiates the format version the environment can offer. Versions newer
/// than the harness knows are clamped; versions older than the minimum fail.
pub fn negotiate_capabilities(requested: u32) -> Result<Capabilities, GraphError> {
    if requested < MIN_FORMAT_VERSION {
        return Err(GraphError::UnsupportedFormatVersion {
            requested,
            min: MIN_FORMAT_VERSION,
        });
    }
    Ok(Capabilities {
        format_version: requested.min(MAX_FORMAT_VERSION),
    })
}

/// A graph definition: a pure forward function plus named parameters.
///
/// `forward` takes `&self`, so evaluating a definition can never mutate its
/// parameters.
pub trait GraphDef {
    /// Build the computation on `session`, returning the output values in
    /// positional order.
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError>;

    /// Named constant state owned by this definition.
    fn parameters(&self) -> Vec<(String, DenseTensor)> {
        Vec::new()
    }
}

enum Backing {
    Eager {
        mode: EvalMode,
        rng: ChaCha8Rng,
        values: Vec<DenseTensor>,
    },
    Symbolic {
        mode: EvalMode,
    },
}

/// Records every op applied through it. In eager mode it also computes
/// values, which makes the recorded node list an execution trace; in symbolic
/// mode it only propagates shapes.
pub struct GraphSession {
    backing: Backing,
    capabilities: Capabilities,
    nodes: Vec<Node>,
    metas: Vec<(Vec<usize>, DType)>,
    params: BTreeMap<String, DenseTensor>,
    param_ids: BTreeMap<String, ValueId>,
    inputs: Vec<ValueId>,
}

impl GraphSession {
    #[must_use]
    pub fn eager(
        inputs: &[DenseTensor],
        mode: EvalMode,
        seed: u64,
        capabilities: Capabilities,
    ) -> Self {
        let mut session = Self {
            backing: Backing::Eager {
                mode,
                rng: ChaCha8Rng::seed_from_u64(seed),
                values: Vec::with_capacity(inputs.len()),
            },
            capabilities,
            nodes: Vec::new(),
            metas: Vec::new(),
            params: BTreeMap::new(),
            param_ids: BTreeMap::new(),
            inputs: Vec::new(),
        };
        for (index, tensor) in inputs.iter().enumerate() {
            let id = session.record(
                Op::Input { index },
                Vec::new(),
                tensor.shape().to_vec(),
                tensor.dtype(),
                Some(tensor.clone()),
            );
            session.inputs.push(id);
        }
        session
    }

    #[must_use]
    pub fn symbolic(decls: &[(Vec<usize>, DType)], capabilities: Capabilities) -> Self {
        let mut session = Self {
            backing: Backing::Symbolic {
                mode: EvalMode::Eval,
            },
            capabilities,
            nodes: Vec::new(),
            metas: Vec::new(),
            params: BTreeMap::new(),
            param_ids: BTreeMap::new(),
            inputs: Vec::new(),
        };
        for (index, (shape, dtype)) in decls.iter().enumerate() {
            let id = session.record(Op::Input { index }, Vec::new(), shape.clone(), *dtype, None);
            session.inputs.push(id);
        }
        session
    }

    #[must_use]
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Sets the eval mode that mode-dependent ops are recorded with.
    #[must_use]
    pub fn in_mode(mut self, eval_mode: EvalMode) -> Self {
        match &mut self.backing {
            Backing::Eager { mode, .. } | Backing::Symbolic { mode } => *mode = eval_mode,
        }
        self
    }

    #[must_use]
    pub fn eval_mode(&self) -> EvalMode {
        match &self.backing {
            Backing::Eager { mode, .. } | Backing::Symbolic { mode } => *mode,
        }
    }

    pub fn shape(&self, id: ValueId) -> Result<&[usize], GraphError> {
        self.metas
            .get(id.0)
            .map(|(shape, _)| shape.as_slice())
            .ok_or(GraphError::UnknownValue { id })
    }

    /// Registers (or re-references) a named parameter.
    pub fn parameter(&mut self, name: &str, tensor: &DenseTensor) -> Result<ValueId, GraphError> {
        if let Some(id) = self.param_ids.get(name) {
            if self.params.get(name) != Some(tensor) {
                return Err(GraphError::ParameterConflict {
                    name: name.to_string(),
                });
            }
            return Ok(*id);
        }
        let value = match self.backing {
            Backing::Eager { .. } => Some(tensor.clone()),
            Backing::Symbolic { .. } => None,
        };
        let id = self.record(
            Op::Parameter {
                name: name.to_string(),
            },
            Vec::new(),
            tensor.shape().to_vec(),
            tensor.dtype(),
            value,
        );
        self.params.insert(name.to_string(), tensor.clone());
        self.param_ids.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn mul_scalar(&mut self, x: ValueId, factor: f64) -> Result<ValueId, GraphError> {
        self.apply(Op::MulScalar { factor }, &[x])
    }

    pub fn add_scalar(&mut self, x: ValueId, offset: f64) -> Result<ValueId, GraphError> {
        self.apply(Op::AddScalar { offset }, &[x])
    }

    pub fn constant_pad(
        &mut self,
        x: ValueId,
        pads: &[(usize, usize)],
        value: f64,
    ) -> Result<ValueId, GraphError> {
        self.apply(
            Op::ConstantPad {
                pads: pads.to_vec(),
                value,
            },
            &[x],
        )
    }

    pub fn amin(&mut self, x: ValueId, dims: &[usize], keepdim: bool) -> Result<ValueId, GraphError> {
        self.apply(
            Op::Amin {
                dims: dims.to_vec(),
                keepdim,
            },
            &[x],
        )
    }

    pub fn prelu(&mut self, x: ValueId, weight: ValueId) -> Result<ValueId, GraphError> {
        self.apply(Op::Prelu, &[x, weight])
    }

    pub fn cumprod(&mut self, x: ValueId, dim: usize) -> Result<ValueId, GraphError> {
        self.apply(Op::Cumprod { dim }, &[x])
    }

    pub fn adaptive_avg_pool2d(
        &mut self,
        x: ValueId,
        output_size: [Option<usize>; 2],
    ) -> Result<ValueId, GraphError> {
        self.apply(Op::AdaptiveAvgPool2d { output_size }, &[x])
    }

    pub fn dropout(&mut self, x: ValueId, p: f64) -> Result<ValueId, GraphError> {
        validate_dropout_probability(p)?;
        let train = self.eval_mode() == EvalMode::Train;
        self.apply(Op::Dropout { p, train }, &[x])
    }

    /// Reads the mean of a value as a host scalar. Only possible on an eager
    /// session; any control flow built on it is specialized into a trace.
    pub fn mean(&self, x: ValueId) -> Result<f64, GraphError> {
        match &self.backing {
            Backing::Eager { values, .. } => values
                .get(x.0)
                .map(mean_all)
                .ok_or(GraphError::UnknownValue { id: x }),
            Backing::Symbolic { .. } => Err(GraphError::DataDependent { op: "mean" }),
        }
    }

    /// Concrete value of `id`, available on eager sessions only.
    pub fn value(&self, id: ValueId) -> Result<&DenseTensor, GraphError> {
        match &self.backing {
            Backing::Eager { values, .. } => {
                values.get(id.0).ok_or(GraphError::UnknownValue { id })
            }
            Backing::Symbolic { .. } => Err(GraphError::DataDependent { op: "value" }),
        }
    }

    /// Closes the session into a graph with the given outputs.
    pub fn finish(self, outputs: &[ValueId]) -> Result<Graph, GraphError> {
        for output in outputs {
            if output.0 >= self.metas.len() {
                return Err(GraphError::UnknownValue { id: *output });
            }
        }
        Ok(Graph {
            nodes: self.nodes,
            outputs: outputs.to_vec(),
            params: self.params,
        })
    }

    fn apply(&mut self, op: Op, args: &[ValueId]) -> Result<ValueId, GraphError> {
        let mut arg_shapes = Vec::with_capacity(args.len());
        for id in args {
            arg_shapes.push(self.shape(*id)?.to_vec());
        }
        let shape = infer_shape(&op, &arg_shapes)?;
        let dtype = self.metas[args[0].0].1;

        let value = match &mut self.backing {
            Backing::Eager { rng, values, .. } => {
                let tensors: Vec<&DenseTensor> = args.iter().map(|id| &values[id.0]).collect();
                Some(evaluate_op(&op, &tensors, Some(rng))?)
            }
            Backing::Symbolic { .. } => None,
        };
        Ok(self.record(op, args.to_vec(), shape, dtype, value))
    }

    fn record(
        &mut self,
        op: Op,
        inputs: Vec<ValueId>,
        shape: Vec<usize>,
        dtype: DType,
        value: Option<DenseTensor>,
    ) -> ValueId {
        let id = ValueId(self.metas.len());
        self.metas.push((shape.clone(), dtype));
        if let (Backing::Eager { values, .. }, Some(value)) = (&mut self.backing, value) {
            values.push(value);
        }
        self.nodes.push(Node {
            op,
            inputs,
            output: id,
            shape,
            dtype,
        });
        id
    }
}

fn infer_shape(op: &Op, args: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    if args.len() != op.arity() {
        return Err(GraphError::Malformed {
            reason: format!(
                "{} applied to {} values, expected {}",
                op.kind(),
                args.len(),
                op.arity()
            ),
        });
    }
    let shape = match op {
        Op::Input { .. } | Op::Parameter { .. } => {
            return Err(GraphError::Malformed {
                reason: format!("{} cannot be applied", op.kind()),
            });
        }
        Op::MulScalar { .. } | Op::AddScalar { .. } | Op::Dropout { .. } => args[0].clone(),
        Op::Prelu => prelu_shape(&args[0], &args[1])?,
        Op::Cumprod { .. } => args[0].clone(),
        Op::ConstantPad { pads, .. } => constant_pad_shape(&args[0], pads)?,
        Op::Amin { dims, keepdim } => amin_shape(&args[0], dims, *keepdim)?,
        Op::AdaptiveAvgPool2d { output_size } => adaptive_avg_pool2d_shape(&args[0], *output_size)?,
    };
    Ok(shape)
}

fn evaluate_op(
    op: &Op,
    args: &[&DenseTensor],
    rng: Option<&mut ChaCha8Rng>,
) -> Result<DenseTensor, GraphError> {
    let out = match op {
        Op::Input { .. } | Op::Parameter { .. } => {
            return Err(GraphError::Malformed {
                reason: format!("{} has no kernel", op.kind()),
            });
        }
        Op::MulScalar { factor } => mul_scalar(args[0], *factor)?,
        Op::AddScalar { offset } => add_scalar(args[0], *offset)?,
        Op::ConstantPad { pads, value } => constant_pad(args[0], pads, *value)?,
        Op::Amin { dims, keepdim } => amin(args[0], dims, *keepdim)?,
        Op::Prelu => prelu(args[0], args[1])?,
        Op::Cumprod { dim } => cumprod(args[0], *dim)?,
        Op::AdaptiveAvgPool2d { output_size } => adaptive_avg_pool2d(args[0], *output_size)?,
        Op::Dropout { train: false, .. } => args[0].clone(),
        Op::Dropout { p, train: true } => match rng {
            Some(rng) => dropout_train(args[0], *p, rng)?,
            None => return Err(GraphError::NonDeterministic { op: "dropout" }),
        },
    };
    Ok(out)
}

/// Options for a reference evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    pub mode: EvalMode,
    pub seed: u64,
    pub capabilities: Capabilities,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            mode: EvalMode::Eval,
            seed: 0,
            capabilities: Capabilities::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRun {
    pub outputs: Vec<DenseTensor>,
    /// Nodes executed during the run, in order.
    pub trace: Graph,
}

/// Runs `def` eagerly on `inputs` and returns its outputs plus the recorded
/// execution trace.
pub fn evaluate_reference(
    def: &dyn GraphDef,
    inputs: &[DenseTensor],
    options: EvalOptions,
) -> Result<ReferenceRun, GraphError> {
    let mut session = GraphSession::eager(inputs, options.mode, options.seed, options.capabilities);
    let input_ids = session.inputs().to_vec();
    let output_ids = def.forward(&mut session, &input_ids)?;
    check_declared_parameters(def, &session)?;
    let outputs = output_ids
        .iter()
        .map(|id| session.value(*id).cloned())
        .collect::<Result<Vec<_>, _>>()?;
    let trace = session.finish(&output_ids)?;
    Ok(ReferenceRun { outputs, trace })
}

/// Builds the static graph of `def` from input declarations alone.
pub fn symbolic_graph(
    def: &dyn GraphDef,
    decls: &[(Vec<usize>, DType)],
    capabilities: Capabilities,
    mode: EvalMode,
) -> Result<Graph, GraphError> {
    let mut session = GraphSession::symbolic(decls, capabilities).in_mode(mode);
    let input_ids = session.inputs().to_vec();
    let output_ids = def.forward(&mut session, &input_ids)?;
    check_declared_parameters(def, &session)?;
    session.finish(&output_ids)
}

/// Every parameter the forward pass registered must carry the value the
/// definition declares for that name.
fn check_declared_parameters(def: &dyn GraphDef, session: &GraphSession) -> Result<(), GraphError> {
    for (name, declared) in def.parameters() {
        if let Some(recorded) = session.params.get(&name)
            && recorded != &declared
        {
            return Err(GraphError::ParameterConflict { name });
        }
    }
    Ok(())
}

/// Interprets a recorded or converted graph on concrete inputs.
pub fn execute(graph: &Graph, inputs: &[DenseTensor]) -> Result<Vec<DenseTensor>, GraphError> {
    graph.validate()?;
    let decls = graph.input_decls();
    if decls.len() != inputs.len() {
        return Err(GraphError::InputCountMismatch {
            expected: decls.len(),
            actual: inputs.len(),
        });
    }

    let mut values: BTreeMap<ValueId, DenseTensor> = BTreeMap::new();
    for node in &graph.nodes {
        let value = match &node.op {
            Op::Input { index } => {
                let tensor = inputs.get(*index).ok_or(GraphError::InputCountMismatch {
                    expected: decls.len(),
                    actual: inputs.len(),
                })?;
                if tensor.shape() != node.shape.as_slice() {
                    return Err(GraphError::InputShapeMismatch {
                        index: *index,
                        expected: node.shape.clone(),
                        actual: tensor.shape().to_vec(),
                    });
                }
                tensor.clone()
            }
            Op::Parameter { name } => graph
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| GraphError::MissingParameter { name: name.clone() })?,
            op => {
                let args = node
                    .inputs
                    .iter()
                    .map(|id| values.get(id).ok_or(GraphError::UnknownValue { id: *id }))
                    .collect::<Result<Vec<_>, _>>()?;
                evaluate_op(op, &args, None)?
            }
        };
        values.insert(node.output, value);
    }

    graph
        .outputs
        .iter()
        .map(|id| {
            values
                .get(id)
                .cloned()
                .ok_or(GraphError::UnknownValue { id: *id })
        })
        .collect()
}
