#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use gp_core::{DType, DenseTensor, EvalMode, sha256_hex};
use gp_graph::{
    Capabilities, EvalOptions, Graph, GraphDef, GraphError, Op, evaluate_reference,
    negotiate_capabilities, symbolic_graph,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;
pub const MODULE_SCHEMA_VERSION: u32 = 1;
const MAX_ARTIFACT_PAYLOAD_BYTES: usize = 16 * 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPath {
    Trace,
    Declarative,
}

impl ExportPath {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Declarative => "declarative",
        }
    }

    /// File extension of artifacts produced on this path.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Declarative => "graph",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Pnnx,
    Ncnn,
}

impl Backend {
    pub const ALL: [Self; 2] = [Self::Pnnx, Self::Ncnn];

    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Pnnx => "pnnx",
            Self::Ncnn => "ncnn",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pnnx" => Ok(Self::Pnnx),
            "ncnn" => Ok(Self::Ncnn),
            other => Err(format!("unknown backend '{other}' (expected pnnx|ncnn)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDecl {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportArtifact {
    pub schema_version: u32,
    pub kind: ExportPath,
    pub format_version: Option<u32>,
    /// Set for traces: branches not taken during recording are absent.
    pub specialized: bool,
    pub inputs: Vec<InputDecl>,
    pub graph: Graph,
    pub source_hash: String,
}

impl ExportArtifact {
    #[must_use]
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.inputs.iter().map(|decl| decl.shape.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub path: ExportPath,
    pub format_version: u32,
    pub eval_mode: EvalMode,
}

impl ExportOptions {
    #[must_use]
    pub fn new(path: ExportPath, format_version: u32) -> Self {
        Self {
            path,
            format_version,
            eval_mode: EvalMode::Eval,
        }
    }
}

/// Converted module written by a converter. Parameters live in a separate
/// [`ParamTable`] next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvertedModule {
    pub schema_version: u32,
    pub backend: Backend,
    pub artifact_hash: String,
    pub inputs: Vec<InputDecl>,
    pub graph: Graph,
}

impl ConvertedModule {
    /// Rejoins the module with its parameter side table into a runnable graph.
    #[must_use]
    pub fn assemble(&self, table: &ParamTable) -> Graph {
        let mut graph = self.graph.clone();
        graph.params = table.params.clone();
        graph
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamTable {
    pub schema_version: u32,
    pub params: BTreeMap<String, DenseTensor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for ArtifactError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportError {
    /// The graph uses an op the selected path cannot represent.
    Unsupported {
        op: String,
        path: ExportPath,
        reason: String,
    },
    Graph(GraphError),
    Artifact(ArtifactError),
    Io {
        path: String,
        reason: String,
    },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { op, path, reason } => {
                write!(f, "{op} unsupported on {} export: {reason}", path.label())
            }
            Self::Graph(error) => write!(f, "graph construction failed: {error}"),
            Self::Artifact(error) => write!(f, "artifact encoding failed: {error}"),
            Self::Io { path, reason } => write!(f, "failed to write {path}: {reason}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<GraphError> for ExportError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<ArtifactError> for ExportError {
    fn from(value: ArtifactError) -> Self {
        Self::Artifact(value)
    }
}

/// Checks one op against the support table of `path`.
pub fn check_op_support(
    path: ExportPath,
    op: &Op,
    capabilities: Capabilities,
) -> Result<(), String> {
    match (path, op) {
        (_, Op::Dropout { train: true, .. }) => {
            Err("train-mode dropout is stochastic and has no static encoding".to_string())
        }
        (ExportPath::Declarative, Op::Cumprod { .. }) => {
            Err("cumulative product has no declarative encoding".to_string())
        }
        (ExportPath::Declarative, op) if !capabilities.supports(op) => Err(format!(
            "requires format version {}, negotiated {}",
            op.min_format_version(),
            capabilities.format_version
        )),
        _ => Ok(()),
    }
}

/// Produces the artifact for `def` without touching the filesystem.
pub fn export_graph(
    def: &dyn GraphDef,
    sample_inputs: &[DenseTensor],
    options: ExportOptions,
) -> Result<ExportArtifact, ExportError> {
    let capabilities = negotiate_capabilities(options.format_version)?;
    let (graph, format_version, specialized) = match options.path {
        ExportPath::Trace => {
            let run = evaluate_reference(
                def,
                sample_inputs,
                EvalOptions {
                    mode: options.eval_mode,
                    seed: 0,
                    capabilities,
                },
            )?;
            (run.trace.pruned(), None, true)
        }
        ExportPath::Declarative => {
            let decls: Vec<(Vec<usize>, DType)> = sample_inputs
                .iter()
                .map(|tensor| (tensor.shape().to_vec(), tensor.dtype()))
                .collect();
            let graph = symbolic_graph(def, &decls, capabilities, options.eval_mode).map_err(
                |error| match error {
                    GraphError::DataDependent { op } => ExportError::Unsupported {
                        op: op.to_string(),
                        path: ExportPath::Declarative,
                        reason: "data-dependent control flow cannot be captured statically"
                            .to_string(),
                    },
                    other => ExportError::Graph(other),
                },
            )?;
            (
                graph.pruned(),
                Some(capabilities.format_version),
                false,
            )
        }
    };

    for node in &graph.nodes {
        check_op_support(options.path, &node.op, capabilities).map_err(|reason| {
            ExportError::Unsupported {
                op: node.op.kind().to_string(),
                path: options.path,
                reason,
            }
        })?;
    }

    let inputs = graph
        .input_decls()
        .into_iter()
        .enumerate()
        .map(|(index, (shape, dtype))| InputDecl {
            name: format!("in{index}"),
            shape,
            dtype,
        })
        .collect::<Vec<_>>();
    let source_hash = artifact_hash(options.path, format_version, specialized, &inputs, &graph)?;
    Ok(ExportArtifact {
        schema_version: ARTIFACT_SCHEMA_VERSION,
        kind: options.path,
        format_version,
        specialized,
        inputs,
        graph,
        source_hash,
    })
}

/// Exports `def` and writes the encoded artifact to `out_path`.
pub fn export_case_artifact(
    def: &dyn GraphDef,
    sample_inputs: &[DenseTensor],
    options: ExportOptions,
    out_path: &Path,
) -> Result<ExportArtifact, ExportError> {
    let artifact = export_graph(def, sample_inputs, options)?;
    let payload = encode_artifact(&artifact)?;
    fs::write(out_path, payload).map_err(|error| ExportError::Io {
        path: out_path.display().to_string(),
        reason: error.to_string(),
    })?;
    Ok(artifact)
}

pub fn encode_artifact(artifact: &ExportArtifact) -> Result<String, ArtifactError> {
    serde_json::to_string(artifact).map_err(|error| ArtifactError::IncompatiblePayload {
        reason: format!("artifact encoding failed: {error}"),
    })
}

pub fn decode_artifact(input: &str) -> Result<ExportArtifact, ArtifactError> {
    let artifact: ExportArtifact = decode_strict(input)?;
    if artifact.schema_version != ARTIFACT_SCHEMA_VERSION {
        return Err(ArtifactError::VersionMismatch {
            expected: ARTIFACT_SCHEMA_VERSION,
            found: artifact.schema_version,
        });
    }
    if artifact.kind == ExportPath::Declarative && artifact.format_version.is_none() {
        return Err(ArtifactError::IncompatiblePayload {
            reason: "declarative artifact without format_version".to_string(),
        });
    }
    let expected = artifact_hash(
        artifact.kind,
        artifact.format_version,
        artifact.specialized,
        &artifact.inputs,
        &artifact.graph,
    )?;
    if expected != artifact.source_hash {
        return Err(ArtifactError::ChecksumMismatch {
            expected,
            found: artifact.source_hash,
        });
    }
    artifact
        .graph
        .validate()
        .map_err(|error| ArtifactError::IncompatiblePayload {
            reason: error.to_string(),
        })?;
    Ok(artifact)
}

/// Splits an artifact into a converted module and its parameter side table,
/// after checking the requested input shapes against the manifest.
pub fn convert_artifact(
    artifact: &ExportArtifact,
    backend: Backend,
    input_shapes: &[Vec<usize>],
) -> Result<(ConvertedModule, ParamTable), ArtifactError> {
    let declared = artifact.input_shapes();
    if declared != input_shapes {
        return Err(ArtifactError::IncompatiblePayload {
            reason: format!(
                "inputshape {} does not match artifact manifest {}",
                format_shape_list(input_shapes),
                format_shape_list(&declared)
            ),
        });
    }
    let mut graph = artifact.graph.clone();
    let params = std::mem::take(&mut graph.params);
    Ok((
        ConvertedModule {
            schema_version: MODULE_SCHEMA_VERSION,
            backend,
            artifact_hash: artifact.source_hash.clone(),
            inputs: artifact.inputs.clone(),
            graph,
        },
        ParamTable {
            schema_version: MODULE_SCHEMA_VERSION,
            params,
        },
    ))
}

pub fn encode_module(module: &ConvertedModule) -> Result<String, ArtifactError> {
    serde_json::to_string(module).map_err(|error| ArtifactError::IncompatiblePayload {
        reason: format!("module encoding failed: {error}"),
    })
}

pub fn decode_module(input: &str) -> Result<ConvertedModule, ArtifactError> {
    let module: ConvertedModule = decode_strict(input)?;
    if module.schema_version != MODULE_SCHEMA_VERSION {
        return Err(ArtifactError::VersionMismatch {
            expected: MODULE_SCHEMA_VERSION,
            found: module.schema_version,
        });
    }
    Ok(module)
}

pub fn encode_param_table(table: &ParamTable) -> Result<String, ArtifactError> {
    serde_json::to_string(table).map_err(|error| ArtifactError::IncompatiblePayload {
        reason: format!("param table encoding failed: {error}"),
    })
}

pub fn decode_param_table(input: &str) -> Result<ParamTable, ArtifactError> {
    let table: ParamTable = decode_strict(input)?;
    if table.schema_version != MODULE_SCHEMA_VERSION {
        return Err(ArtifactError::VersionMismatch {
            expected: MODULE_SCHEMA_VERSION,
            found: table.schema_version,
        });
    }
    Ok(table)
}

#[must_use]
pub fn artifact_file_name(stem: &str, path: ExportPath) -> String {
    format!("{stem}.{}", path.extension())
}

#[must_use]
pub fn module_file_name(stem: &str, backend: Backend) -> String {
    format!("{stem}_{}.json", backend.suffix())
}

#[must_use]
pub fn param_table_file_name(stem: &str, backend: Backend) -> String {
    format!("{stem}_{}.params.json", backend.suffix())
}

/// Side table location for a converted module: `x_pnnx.json` maps to
/// `x_pnnx.params.json`.
#[must_use]
pub fn param_table_path_for(module_path: &Path) -> PathBuf {
    module_path.with_extension("params.json")
}

/// Renders shapes as the converter's `inputshape` value: `[1,2],[3]`.
#[must_use]
pub fn format_shape_list(shapes: &[Vec<usize>]) -> String {
    shapes
        .iter()
        .map(|shape| {
            let dims = shape
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{dims}]")
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_shape_list(raw: &str) -> Result<Vec<Vec<usize>>, String> {
    let mut shapes = Vec::new();
    let mut rest = raw.trim();
    while !rest.is_empty() {
        let body = rest
            .strip_prefix('[')
            .ok_or_else(|| format!("expected '[' in shape list at '{rest}'"))?;
        let close = body
            .find(']')
            .ok_or_else(|| format!("unterminated shape group in '{raw}'"))?;
        let dims = body[..close]
            .split(',')
            .map(|dim| {
                dim.trim()
                    .parse::<usize>()
                    .map_err(|error| format!("invalid dimension '{dim}': {error}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        shapes.push(dims);
        rest = &body[close + 1..];
        if let Some(next) = rest.strip_prefix(',') {
            if next.is_empty() {
                return Err(format!("trailing comma in shape list '{raw}'"));
            }
            rest = next;
        } else if !rest.is_empty() {
            return Err(format!("expected ',' between shape groups in '{raw}'"));
        }
    }
    if shapes.is_empty() {
        return Err("shape list is empty".to_string());
    }
    Ok(shapes)
}

fn decode_strict<T: DeserializeOwned>(input: &str) -> Result<T, ArtifactError> {
    validate_payload_size(input)?;
    serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            ArtifactError::UnknownField { field }
        } else {
            ArtifactError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn validate_payload_size(input: &str) -> Result<(), ArtifactError> {
    let actual = input.len();
    if actual > MAX_ARTIFACT_PAYLOAD_BYTES {
        return Err(ArtifactError::IncompatiblePayload {
            reason: format!(
                "payload exceeds max bytes: actual={actual} max={MAX_ARTIFACT_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn artifact_hash(
    kind: ExportPath,
    format_version: Option<u32>,
    specialized: bool,
    inputs: &[InputDecl],
    graph: &Graph,
) -> Result<String, ArtifactError> {
    let canonical = serde_json::to_vec(&(
        ARTIFACT_SCHEMA_VERSION,
        kind,
        format_version,
        specialized,
        inputs,
        graph,
    ))
    .map_err(|error| ArtifactError::IncompatiblePayload {
        reason: format!("artifact hashing failed: {error}"),
    })?;
    Ok(format!("sha256:{}", sha256_hex(&canonical)))
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}

#[cfg(test)]
mod tests {
    use gp_core::{DType, DenseTensor, EvalMode, InputSpec, SeededGenerator};
    use gp_graph::{
        DEFAULT_FORMAT_VERSION, GraphDef, GraphError, GraphSession, PARTIAL_ADAPTIVE_POOL_MIN_VERSION,
        ValueId, execute,
    };
    use proptest::prelude::*;

    use super::{
        ArtifactError, Backend, ExportError, ExportOptions, ExportPath, artifact_file_name,
        convert_artifact, decode_artifact, decode_module, decode_param_table, encode_artifact,
        encode_module, encode_param_table, export_case_artifact, export_graph, format_shape_list,
        module_file_name, param_table_file_name, param_table_path_for, parse_shape_list,
    };

    struct RunningProduct;

    impl GraphDef for RunningProduct {
        fn forward(
            &self,
            session: &mut GraphSession,
            inputs: &[ValueId],
        ) -> Result<Vec<ValueId>, GraphError> {
            Ok(vec![session.cumprod(inputs[0], 0)?])
        }
    }

    struct PaddedSlope {
        slope: DenseTensor,
    }

    impl GraphDef for PaddedSlope {
        fn forward(
            &self,
            session: &mut GraphSession,
            inputs: &[ValueId],
        ) -> Result<Vec<ValueId>, GraphError> {
            let weight = session.parameter("slope", &self.slope)?;
            let padded = session.constant_pad(inputs[0], &[(1, 1)], -0.5)?;
            // dead branch, pruned on both paths
            session.mul_scalar(padded, 3.0)?;
            Ok(vec![session.prelu(padded, weight)?])
        }
    }

    struct Gated;

    impl GraphDef for Gated {
        fn forward(
            &self,
            session: &mut GraphSession,
            inputs: &[ValueId],
        ) -> Result<Vec<ValueId>, GraphError> {
            let full = session.adaptive_avg_pool2d(inputs[0], [Some(2), Some(2)])?;
            if session.capabilities().at_least(PARTIAL_ADAPTIVE_POOL_MIN_VERSION) {
                let partial = session.adaptive_avg_pool2d(inputs[0], [None, Some(2)])?;
                return Ok(vec![full, partial]);
            }
            Ok(vec![full])
        }
    }

    struct Noisy;

    impl GraphDef for Noisy {
        fn forward(
            &self,
            session: &mut GraphSession,
            inputs: &[ValueId],
        ) -> Result<Vec<ValueId>, GraphError> {
            Ok(vec![session.dropout(inputs[0], 0.5)?])
        }
    }

    fn sample(shape: Vec<usize>) -> DenseTensor {
        SeededGenerator::new(0)
            .generate(&InputSpec::uniform01(shape))
            .expect("sample")
    }

    fn slope() -> DenseTensor {
        DenseTensor::new(vec![1], DType::F32, vec![0.25]).expect("slope")
    }

    #[test]
    fn trace_export_is_specialized_and_pruned() {
        let def = PaddedSlope { slope: slope() };
        let artifact = export_graph(
            &def,
            &[sample(vec![2, 3])],
            ExportOptions::new(ExportPath::Trace, DEFAULT_FORMAT_VERSION),
        )
        .expect("trace export");
        assert!(artifact.specialized);
        assert_eq!(artifact.format_version, None);
        assert!(!artifact.graph.op_kinds().contains("mul_scalar"));
        assert_eq!(artifact.inputs[0].name, "in0");
        assert_eq!(artifact.input_shapes(), vec![vec![2, 3]]);
        let hex = artifact
            .source_hash
            .strip_prefix("sha256:")
            .expect("sha256 label");
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn declarative_export_records_negotiated_version() {
        let def = PaddedSlope { slope: slope() };
        let artifact = export_graph(
            &def,
            &[sample(vec![2, 3])],
            ExportOptions::new(ExportPath::Declarative, 12),
        )
        .expect("declarative export");
        assert!(!artifact.specialized);
        assert_eq!(artifact.format_version, Some(12));
        assert_eq!(artifact.graph.params.len(), 1);
    }

    #[test]
    fn cumprod_is_trace_only() {
        let x = sample(vec![3, 4]);
        export_graph(
            &RunningProduct,
            &[x.clone()],
            ExportOptions::new(ExportPath::Trace, DEFAULT_FORMAT_VERSION),
        )
        .expect("trace handles cumprod");
        let err = export_graph(
            &RunningProduct,
            &[x],
            ExportOptions::new(ExportPath::Declarative, DEFAULT_FORMAT_VERSION),
        )
        .expect_err("declarative rejects cumprod");
        assert!(matches!(
            err,
            ExportError::Unsupported { ref op, path: ExportPath::Declarative, .. } if op == "cumprod"
        ));
    }

    #[test]
    fn train_mode_dropout_is_rejected_on_both_paths() {
        for path in [ExportPath::Trace, ExportPath::Declarative] {
            let options = ExportOptions {
                eval_mode: EvalMode::Train,
                ..ExportOptions::new(path, DEFAULT_FORMAT_VERSION)
            };
            let err = export_graph(&Noisy, &[sample(vec![4])], options)
                .expect_err("train dropout is stochastic");
            assert!(matches!(err, ExportError::Unsupported { ref op, .. } if op == "dropout"));
        }
        export_graph(
            &Noisy,
            &[sample(vec![4])],
            ExportOptions::new(ExportPath::Declarative, DEFAULT_FORMAT_VERSION),
        )
        .expect("eval dropout is identity");
    }

    #[test]
    fn version_gate_controls_output_arity() {
        let x = sample(vec![1, 2, 4, 6]);
        let old = export_graph(
            &Gated,
            &[x.clone()],
            ExportOptions::new(ExportPath::Declarative, PARTIAL_ADAPTIVE_POOL_MIN_VERSION - 1),
        )
        .expect("old version");
        let new = export_graph(
            &Gated,
            &[x],
            ExportOptions::new(ExportPath::Declarative, PARTIAL_ADAPTIVE_POOL_MIN_VERSION),
        )
        .expect("new version");
        assert_eq!(old.graph.outputs.len(), 1);
        assert_eq!(new.graph.outputs.len(), 2);
        assert_eq!(new.graph.output_shapes()[1], vec![1, 2, 4, 2]);
    }

    #[test]
    fn decode_rejects_tampering_and_unknown_fields() {
        let artifact = export_graph(
            &PaddedSlope { slope: slope() },
            &[sample(vec![5])],
            ExportOptions::new(ExportPath::Trace, DEFAULT_FORMAT_VERSION),
        )
        .expect("export");
        let wire = encode_artifact(&artifact).expect("encode");
        assert_eq!(decode_artifact(&wire).expect("decode"), artifact);

        let mut value: serde_json::Value = serde_json::from_str(&wire).expect("json");
        value["specialized"] = serde_json::Value::Bool(false);
        let tampered = serde_json::to_string(&value).expect("tampered");
        assert!(matches!(
            decode_artifact(&tampered),
            Err(ArtifactError::ChecksumMismatch { .. })
        ));

        value["extra"] = serde_json::Value::from(1);
        let unknown = serde_json::to_string(&value).expect("unknown");
        assert_eq!(
            decode_artifact(&unknown),
            Err(ArtifactError::UnknownField {
                field: "extra".to_string()
            })
        );

        let mut versioned: serde_json::Value = serde_json::from_str(&wire).expect("json");
        versioned["schema_version"] = serde_json::Value::from(9);
        let versioned = serde_json::to_string(&versioned).expect("versioned");
        assert!(matches!(
            decode_artifact(&versioned),
            Err(ArtifactError::VersionMismatch { expected: 1, found: 9 })
        ));
    }

    #[test]
    fn conversion_splits_params_and_reassembles() {
        let def = PaddedSlope { slope: slope() };
        let x = sample(vec![2, 2]);
        let artifact = export_graph(
            &def,
            &[x.clone()],
            ExportOptions::new(ExportPath::Trace, DEFAULT_FORMAT_VERSION),
        )
        .expect("export");
        let (module, table) =
            convert_artifact(&artifact, Backend::Ncnn, &[vec![2, 2]]).expect("convert");
        assert!(module.graph.params.is_empty());
        assert_eq!(table.params.len(), 1);

        let module = decode_module(&encode_module(&module).expect("encode module")).expect("module");
        let table =
            decode_param_table(&encode_param_table(&table).expect("encode table")).expect("table");
        let replayed = execute(&module.assemble(&table), &[x]).expect("execute");
        let reference = execute(&artifact.graph, &[sample(vec![2, 2])]).expect("reference");
        assert_eq!(replayed, reference);

        assert!(convert_artifact(&artifact, Backend::Ncnn, &[vec![2, 3]]).is_err());
    }

    #[test]
    fn export_case_artifact_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir
            .path()
            .join(artifact_file_name("padded_slope", ExportPath::Declarative));
        let artifact = export_case_artifact(
            &PaddedSlope { slope: slope() },
            &[sample(vec![3])],
            ExportOptions::new(ExportPath::Declarative, DEFAULT_FORMAT_VERSION),
            &path,
        )
        .expect("export");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(decode_artifact(&raw).expect("decode"), artifact);
        assert!(path.ends_with("padded_slope.graph"));
    }

    #[test]
    fn naming_follows_stem_and_backend() {
        assert_eq!(artifact_file_name("case", ExportPath::Trace), "case.trace");
        assert_eq!(module_file_name("case", Backend::Pnnx), "case_pnnx.json");
        assert_eq!(
            param_table_file_name("case", Backend::Ncnn),
            "case_ncnn.params.json"
        );
        assert_eq!(
            param_table_path_for(std::path::Path::new("/tmp/work/case_pnnx.json")),
            std::path::PathBuf::from("/tmp/work/case_pnnx.params.json")
        );
        assert_eq!(Backend::parse("ncnn"), Ok(Backend::Ncnn));
        assert!(Backend::parse("onnx").is_err());
    }

    #[test]
    fn shape_list_grammar() {
        let shapes = vec![vec![1, 12, 24, 64], vec![5]];
        assert_eq!(format_shape_list(&shapes), "[1,12,24,64],[5]");
        assert_eq!(parse_shape_list("[1,12,24,64],[5]"), Ok(shapes));
        assert!(parse_shape_list("").is_err());
        assert!(parse_shape_list("[1,2],").is_err());
        assert!(parse_shape_list("[1,2][3]").is_err());
        assert!(parse_shape_list("[1,x]").is_err());
    }

    proptest! {
        #[test]
        fn prop_shape_list_parses_what_it_formats(
            shapes in proptest::collection::vec(
                proptest::collection::vec(1usize..64, 1..5),
                1..4,
            ),
        ) {
            let rendered = format_shape_list(&shapes);
            prop_assert!(!rendered.contains(' '));
            prop_assert_eq!(parse_shape_list(&rendered), Ok(shapes));
        }
    }
}
