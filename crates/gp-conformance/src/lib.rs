#![forbid(unsafe_code)]

pub mod cases;
mod compare;
mod logging;
mod process;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use gp_core::{DenseTensor, EvalMode, InputSpec, SeededGenerator, sha256_u64s};
use gp_export::{
    ExportError, ExportOptions, artifact_file_name, decode_module, decode_param_table,
    export_case_artifact, format_shape_list, module_file_name, param_table_path_for,
};
use gp_graph::{
    DEFAULT_FORMAT_VERSION, EvalOptions, Graph, GraphDef, GraphError, evaluate_reference, execute,
    negotiate_capabilities,
};
use gp_runtime::{CaseRuntime, StageKind, StageLedger, StageOutcome, StageTimer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tempfile::TempDir;

pub use compare::{DEFAULT_TOLERANCE, EquivalencePolicy, OutputCheck, PolicySet, compare_outputs};
pub use gp_export::{Backend, ExportPath};
pub use logging::{CASE_LOG_SCHEMA_VERSION, StructuredCaseLog, canonical_case_name, scenario_id};

use process::{ChildError, bounded_diagnostic, last_output_line, run_child, stream_tail};

pub const SUITE_ID: &str = "graph_parity";
pub const DEFAULT_CONVERTER: &str = "pnnx";
const STREAM_TAIL_BYTES: usize = 2_048;
const MAX_RUNNER_OUTPUT_LINE_BYTES: usize = process::MAX_CHILD_STDOUT_BYTES;
const RUNNER_RAW_DIAGNOSTIC_BYTES: usize = 256;

/// How converted modules are evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateRunner {
    /// Load module + side table and run them with the in-process interpreter.
    Interpreter,
    /// Spawn `<program> <module-path>`, exchanging tensors as JSON over stdio.
    Module { program: PathBuf },
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub converter: PathBuf,
    pub work_root: PathBuf,
    pub format_version: u32,
    /// `None` blocks until the converter exits.
    pub converter_timeout_millis: Option<u64>,
    pub keep_artifacts: bool,
    pub runner: CandidateRunner,
    pub eval_mode: EvalMode,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            converter: PathBuf::from(DEFAULT_CONVERTER),
            work_root: std::env::temp_dir().join("graph-parity"),
            format_version: DEFAULT_FORMAT_VERSION,
            converter_timeout_millis: None,
            keep_artifacts: false,
            runner: CandidateRunner::Interpreter,
            eval_mode: EvalMode::Eval,
        }
    }

    /// Defaults overlaid with `GP_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::default_paths().with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(converter) = lookup("GP_CONVERTER") {
            self.converter = PathBuf::from(converter);
        }
        if let Some(root) = lookup("GP_WORK_ROOT") {
            self.work_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("GP_FORMAT_VERSION") {
            self.format_version = raw
                .trim()
                .parse()
                .map_err(|error| format!("GP_FORMAT_VERSION='{raw}' is not a version: {error}"))?;
        }
        if let Some(raw) = lookup("GP_CONVERTER_TIMEOUT_MS") {
            self.converter_timeout_millis = parse_timeout_millis(&raw)
                .map_err(|reason| format!("GP_CONVERTER_TIMEOUT_MS='{raw}' {reason}"))?;
        }
        if let Some(raw) = lookup("GP_KEEP_ARTIFACTS") {
            self.keep_artifacts = parse_flag(&raw)
                .ok_or_else(|| format!("GP_KEEP_ARTIFACTS='{raw}' is not a boolean"))?;
        }
        if let Some(program) = lookup("GP_MODULE_RUNNER") {
            self.runner = CandidateRunner::Module {
                program: PathBuf::from(program),
            };
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_converter(mut self, converter: impl Into<PathBuf>) -> Self {
        self.converter = converter.into();
        self
    }

    #[must_use]
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }

    #[must_use]
    pub fn with_format_version(mut self, format_version: u32) -> Self {
        self.format_version = format_version;
        self
    }

    #[must_use]
    pub fn with_converter_timeout_millis(mut self, millis: Option<u64>) -> Self {
        self.converter_timeout_millis = millis;
        self
    }

    #[must_use]
    pub fn with_keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    #[must_use]
    pub fn with_runner(mut self, runner: CandidateRunner) -> Self {
        self.runner = runner;
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// One conformance case: a graph definition plus everything needed to run it
/// through the export/convert/compare pipeline.
pub struct GraphCase {
    pub name: String,
    pub def: Box<dyn GraphDef>,
    pub inputs: Vec<InputSpec>,
    pub path: ExportPath,
    pub backend: Backend,
    pub policies: PolicySet,
    pub seed: u64,
}

impl GraphCase {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        def: Box<dyn GraphDef>,
        inputs: Vec<InputSpec>,
        path: ExportPath,
        backend: Backend,
        policies: PolicySet,
    ) -> Self {
        Self {
            name: name.into(),
            def,
            inputs,
            path,
            backend,
            policies,
            seed: 0,
        }
    }

    #[must_use]
    pub fn stem(&self) -> String {
        canonical_case_name(&self.name)
    }
}

impl fmt::Debug for GraphCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphCase")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("path", &self.path)
            .field("backend", &self.backend)
            .field("policies", &self.policies)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// Fatal failure classification of a case. Any of these fails the case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CaseFailure {
    UnsupportedOperation {
        op: String,
        path: ExportPath,
        reason: String,
    },
    ConversionFailure {
        reason: String,
        exit_code: Option<i32>,
    },
    StructuralMismatch {
        reason: String,
    },
    /// Indices of outputs that violated their policy.
    NumericalMismatch {
        outputs: Vec<usize>,
    },
    Reference {
        reason: String,
    },
    Harness {
        reason: String,
    },
}

impl CaseFailure {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnsupportedOperation { .. } => "unsupported_operation",
            Self::ConversionFailure { .. } => "conversion_failure",
            Self::StructuralMismatch { .. } => "structural_mismatch",
            Self::NumericalMismatch { .. } => "numerical_mismatch",
            Self::Reference { .. } => "reference_failure",
            Self::Harness { .. } => "harness_failure",
        }
    }
}

impl fmt::Display for CaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOperation { op, path, reason } => {
                write!(f, "unsupported operation {op} on {} path: {reason}", path.label())
            }
            Self::ConversionFailure { reason, exit_code } => match exit_code {
                Some(code) => write!(f, "conversion failed (exit {code}): {reason}"),
                None => write!(f, "conversion failed: {reason}"),
            },
            Self::StructuralMismatch { reason } => write!(f, "structural mismatch: {reason}"),
            Self::NumericalMismatch { outputs } => {
                write!(f, "numerical mismatch at outputs {outputs:?}")
            }
            Self::Reference { reason } => write!(f, "reference evaluation failed: {reason}"),
            Self::Harness { reason } => write!(f, "harness failure: {reason}"),
        }
    }
}

impl std::error::Error for CaseFailure {}

impl From<ExportError> for CaseFailure {
    fn from(value: ExportError) -> Self {
        match value {
            ExportError::Unsupported { op, path, reason } => {
                Self::UnsupportedOperation { op, path, reason }
            }
            other => Self::Harness {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedArtifact {
    pub module: PathBuf,
    pub params: Option<PathBuf>,
}

/// Everything observed about one converter invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionOutcome {
    pub artifact: PathBuf,
    pub backend: Backend,
    pub converted: Option<ConvertedArtifact>,
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: u128,
    pub diagnostic: Option<String>,
}

impl ConversionOutcome {
    fn failed(artifact: &Path, backend: Backend, diagnostic: String) -> Self {
        Self {
            artifact: artifact.to_path_buf(),
            backend,
            converted: None,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration_ms: 0,
            diagnostic: Some(diagnostic),
        }
    }

    pub fn result(&self) -> Result<ConvertedArtifact, CaseFailure> {
        match &self.converted {
            Some(converted) => Ok(converted.clone()),
            None => {
                let mut reason = self
                    .diagnostic
                    .clone()
                    .unwrap_or_else(|| "converter produced no module".to_string());
                if !self.stderr_tail.is_empty() {
                    reason.push_str("; stderr: ");
                    reason.push_str(&self.stderr_tail);
                }
                Err(CaseFailure::ConversionFailure {
                    reason,
                    exit_code: self.exit_code,
                })
            }
        }
    }
}

/// Runs `<converter> <artifact> inputshape=<shapes>` in the artifact's
/// directory and locates `<stem>_<backend>.json` next to it.
#[must_use]
pub fn invoke_converter(
    config: &HarnessConfig,
    artifact_path: &Path,
    input_shapes: &[Vec<usize>],
    backend: Backend,
) -> ConversionOutcome {
    let (Some(work_dir), Some(stem)) = (
        artifact_path.parent(),
        artifact_path.file_stem().and_then(|stem| stem.to_str()),
    ) else {
        return ConversionOutcome::failed(
            artifact_path,
            backend,
            format!("artifact path {} has no stem", artifact_path.display()),
        );
    };

    let mut command = Command::new(resolve_program(&config.converter));
    command
        .arg(artifact_path)
        .arg(format!("inputshape={}", format_shape_list(input_shapes)))
        .current_dir(work_dir);

    let output = match run_child(command, None, config.converter_timeout_millis, "converter") {
        Ok(output) => output,
        Err(error) => {
            return ConversionOutcome::failed(artifact_path, backend, error.describe("converter"));
        }
    };

    let mut outcome = ConversionOutcome {
        artifact: artifact_path.to_path_buf(),
        backend,
        converted: None,
        exit_code: output.status.code(),
        stdout_tail: stream_tail(&output.stdout, STREAM_TAIL_BYTES),
        stderr_tail: stream_tail(&output.stderr, STREAM_TAIL_BYTES),
        duration_ms: output.duration_ms,
        diagnostic: None,
    };
    if !output.status.success() {
        outcome.diagnostic = Some(format!("converter exited with status {}", output.status));
        return outcome;
    }

    let module = work_dir.join(module_file_name(stem, backend));
    if !module.is_file() {
        outcome.diagnostic = Some(format!(
            "converter exited successfully but produced no {}",
            module.display()
        ));
        return outcome;
    }
    let params = param_table_path_for(&module);
    outcome.converted = Some(ConvertedArtifact {
        module,
        params: params.is_file().then_some(params),
    });
    outcome
}

/// Loads a converted module and, when present, its parameter side table.
pub fn load_converted_graph(module_path: &Path) -> Result<Graph, String> {
    let raw = fs::read_to_string(module_path)
        .map_err(|error| format!("failed reading module {}: {error}", module_path.display()))?;
    let module = decode_module(&raw)
        .map_err(|error| format!("invalid module {}: {error}", module_path.display()))?;
    let params_path = param_table_path_for(module_path);
    if !params_path.is_file() {
        return Ok(module.graph);
    }
    let raw = fs::read_to_string(&params_path).map_err(|error| {
        format!(
            "failed reading param table {}: {error}",
            params_path.display()
        )
    })?;
    let table = decode_param_table(&raw)
        .map_err(|error| format!("invalid param table {}: {error}", params_path.display()))?;
    Ok(module.assemble(&table))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleRunnerRequest {
    pub inputs: Vec<DenseTensor>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleRunnerResponse {
    pub outputs: Vec<DenseTensor>,
}

/// Evaluates the converted module on the same inputs the reference saw.
pub fn evaluate_candidate(
    config: &HarnessConfig,
    converted: &ConvertedArtifact,
    inputs: &[DenseTensor],
) -> Result<Vec<DenseTensor>, CaseFailure> {
    match &config.runner {
        CandidateRunner::Interpreter => {
            let graph = load_converted_graph(&converted.module).map_err(|reason| {
                CaseFailure::ConversionFailure {
                    reason,
                    exit_code: None,
                }
            })?;
            execute(&graph, inputs).map_err(|error| match error {
                GraphError::InputCountMismatch { .. } | GraphError::InputShapeMismatch { .. } => {
                    CaseFailure::StructuralMismatch {
                        reason: error.to_string(),
                    }
                }
                other => CaseFailure::ConversionFailure {
                    reason: format!("converted module failed to execute: {other}"),
                    exit_code: None,
                },
            })
        }
        CandidateRunner::Module { program } => run_module_program(program, converted, inputs),
    }
}

fn run_module_program(
    program: &Path,
    converted: &ConvertedArtifact,
    inputs: &[DenseTensor],
) -> Result<Vec<DenseTensor>, CaseFailure> {
    let harness = |reason: String| CaseFailure::Harness { reason };
    let body = serde_json::to_vec(&ModuleRunnerRequest {
        inputs: inputs.to_vec(),
    })
    .map_err(|error| harness(format!("failed to serialize runner payload: {error}")))?;

    let mut command = Command::new(resolve_program(program));
    command.arg(&converted.module);
    if let Some(dir) = converted.module.parent() {
        command.current_dir(dir);
    }
    let output = run_child(command, Some(body), None, "module runner").map_err(|error| {
        match error {
            ChildError::Spawn { .. } => harness(error.describe("module runner")),
            other => CaseFailure::ConversionFailure {
                reason: other.describe("module runner"),
                exit_code: None,
            },
        }
    })?;
    if !output.status.success() {
        return Err(CaseFailure::ConversionFailure {
            reason: format!(
                "module runner exited with status {}: {}",
                output.status,
                stream_tail(&output.stderr, STREAM_TAIL_BYTES)
            ),
            exit_code: output.status.code(),
        });
    }

    let stdout = String::from_utf8(output.stdout)
        .map_err(|error| harness(format!("module runner stdout was not utf8: {error}")))?;
    let line = last_output_line(&stdout, MAX_RUNNER_OUTPUT_LINE_BYTES).map_err(harness)?;
    let response: ModuleRunnerResponse = serde_json::from_str(line).map_err(|error| {
        CaseFailure::StructuralMismatch {
            reason: format!(
                "module runner output parse failure: {error}; raw={}",
                bounded_diagnostic(line, RUNNER_RAW_DIAGNOSTIC_BYTES)
            ),
        }
    })?;
    Ok(response.outputs)
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub stem: String,
    pub path: ExportPath,
    pub backend: Backend,
    pub verdict: Verdict,
    pub failure: Option<CaseFailure>,
    pub checks: Vec<OutputCheck>,
    pub conversion: Option<ConversionOutcome>,
    /// Whether the exported artifact was specialized to the example input
    /// shapes. `None` when the case failed before export.
    pub specialized: Option<bool>,
    pub ledger: StageLedger,
    /// Set when artifacts were kept on disk.
    pub work_dir: Option<PathBuf>,
    pub forensic_log: StructuredCaseLog,
}

impl CaseReport {
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.verdict.exit_code()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub format_version: u32,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        if self.cases_total == self.cases_passed {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.verdict().exit_code()
    }
}

#[derive(Default)]
struct CaseTrail {
    work_dir: Option<TempDir>,
    artifact_refs: Vec<String>,
    input_digest: u64,
    output_digest: u64,
    conversion: Option<ConversionOutcome>,
    checks: Vec<OutputCheck>,
    format_version: u32,
    specialized: Option<bool>,
}

/// Runs one case end to end. Never panics on case-level failures; every
/// failure is folded into the returned report.
#[must_use]
pub fn run_case(config: &HarnessConfig, case: &GraphCase) -> CaseReport {
    let started_at = Instant::now();
    let stem = case.stem();
    let mut runtime = CaseRuntime::new(stem.clone(), config.eval_mode);
    let mut trail = CaseTrail {
        format_version: config.format_version,
        ..CaseTrail::default()
    };

    let failure = drive_case(config, case, &stem, &mut runtime, &mut trail).err();
    let verdict = if failure.is_none() {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    let work_dir = trail.work_dir.take().and_then(|dir| {
        if config.keep_artifacts {
            Some(dir.keep())
        } else {
            None
        }
    });

    let forensic_log = build_case_log(
        config,
        case,
        &stem,
        &runtime,
        &trail,
        failure.as_ref(),
        started_at.elapsed().as_millis(),
    );
    CaseReport {
        name: case.name.clone(),
        stem,
        path: case.path,
        backend: case.backend,
        verdict,
        failure,
        checks: trail.checks,
        conversion: trail.conversion,
        specialized: trail.specialized,
        ledger: runtime.ledger().clone(),
        work_dir,
        forensic_log,
    }
}

/// Runs `cases` in order; the suite passes only if every case passes.
#[must_use]
pub fn run_suite(config: &HarnessConfig, cases: &[GraphCase]) -> (HarnessReport, Vec<CaseReport>) {
    let reports: Vec<CaseReport> = cases.iter().map(|case| run_case(config, case)).collect();
    let (cases_total, cases_passed) =
        summarize_passes(reports.iter().map(|report| report.verdict == Verdict::Pass));
    (
        HarnessReport {
            suite: SUITE_ID,
            format_version: config.format_version,
            cases_total,
            cases_passed,
        },
        reports,
    )
}

/// Writes one JSON line per report; returns the number of lines written.
pub fn emit_case_logs(reports: &[CaseReport], output_path: &Path) -> Result<usize, String> {
    let mut lines = String::new();
    for report in reports {
        let line = serde_json::to_string(&report.forensic_log)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create case log dir {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write case log {}: {error}",
            output_path.display()
        )
    })?;
    Ok(reports.len())
}

fn drive_case(
    config: &HarnessConfig,
    case: &GraphCase,
    stem: &str,
    runtime: &mut CaseRuntime,
    trail: &mut CaseTrail,
) -> Result<(), CaseFailure> {
    let timer = runtime.begin_stage(StageKind::Reference);
    let prepared = negotiate_capabilities(config.format_version)
        .map_err(|error| CaseFailure::Harness {
            reason: error.to_string(),
        })
        .and_then(|capabilities| {
            let inputs = SeededGenerator::new(case.seed)
                .generate_all(&case.inputs)
                .map_err(|error| CaseFailure::Reference {
                    reason: format!("input generation failed: {error}"),
                })?;
            let run = evaluate_reference(
                case.def.as_ref(),
                &inputs,
                EvalOptions {
                    mode: config.eval_mode,
                    seed: case.seed,
                    capabilities,
                },
            )
            .map_err(|error| CaseFailure::Reference {
                reason: error.to_string(),
            })?;
            Ok((capabilities, inputs, run.outputs))
        });
    let (capabilities, inputs, reference) = staged(runtime, timer, prepared, |(_, _, outputs)| {
        format!("{} reference outputs", outputs.len())
    })?;
    trail.format_version = capabilities.format_version;
    trail.input_digest = tensors_digest(&inputs);
    trail.output_digest = tensors_digest(&reference);

    let timer = runtime.begin_stage(StageKind::Export);
    let exported = prepare_work_dir(config, stem).and_then(|dir| {
        let artifact_path = dir.path().join(artifact_file_name(stem, case.path));
        trail.work_dir = Some(dir);
        let options = ExportOptions {
            path: case.path,
            format_version: capabilities.format_version,
            eval_mode: config.eval_mode,
        };
        export_case_artifact(case.def.as_ref(), &inputs, options, &artifact_path)
            .map(|artifact| (artifact_path, artifact))
            .map_err(CaseFailure::from)
    });
    let (artifact_path, artifact) = staged(runtime, timer, exported, |(path, artifact)| {
        format!(
            "{} nodes written to {}",
            artifact.graph.nodes.len(),
            path.display()
        )
    })?;
    trail
        .artifact_refs
        .push(artifact_path.display().to_string());
    trail.specialized = Some(artifact.specialized);

    let timer = runtime.begin_stage(StageKind::Convert);
    let outcome = invoke_converter(config, &artifact_path, &artifact.input_shapes(), case.backend);
    let converted = outcome.result();
    trail.conversion = Some(outcome);
    let converted = staged(runtime, timer, converted, |converted| {
        format!("module at {}", converted.module.display())
    })?;
    trail
        .artifact_refs
        .push(converted.module.display().to_string());

    let timer = runtime.begin_stage(StageKind::Candidate);
    let candidate = staged(
        runtime,
        timer,
        evaluate_candidate(config, &converted, &inputs),
        |outputs| format!("{} candidate outputs", outputs.len()),
    )?;

    let timer = runtime.begin_stage(StageKind::Compare);
    let compared = compare_outputs(&reference, &candidate, &case.policies).and_then(|checks| {
        let failing: Vec<usize> = checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| check.index)
            .collect();
        trail.checks = checks;
        if failing.is_empty() {
            Ok(())
        } else {
            Err(CaseFailure::NumericalMismatch { outputs: failing })
        }
    });
    staged(runtime, timer, compared, |()| {
        format!("{} outputs within policy", reference.len())
    })
}

fn staged<T>(
    runtime: &mut CaseRuntime,
    timer: StageTimer,
    result: Result<T, CaseFailure>,
    summary: impl FnOnce(&T) -> String,
) -> Result<T, CaseFailure> {
    match result {
        Ok(value) => {
            runtime.finish_stage(timer, summary(&value));
            Ok(value)
        }
        Err(failure) => {
            runtime.fail_stage(timer, &failure);
            Err(failure)
        }
    }
}

fn prepare_work_dir(config: &HarnessConfig, stem: &str) -> Result<TempDir, CaseFailure> {
    let harness = |reason: String| CaseFailure::Harness { reason };
    let root = std::path::absolute(&config.work_root).map_err(|error| {
        harness(format!(
            "failed to resolve work root {}: {error}",
            config.work_root.display()
        ))
    })?;
    fs::create_dir_all(&root)
        .map_err(|error| harness(format!("failed to create {}: {error}", root.display())))?;
    tempfile::Builder::new()
        .prefix(&format!("{stem}-"))
        .tempdir_in(&root)
        .map_err(|error| {
            harness(format!(
                "failed to create case dir under {}: {error}",
                root.display()
            ))
        })
}

/// Relative program paths with a directory component are resolved before the
/// child's working directory changes.
fn resolve_program(program: &Path) -> PathBuf {
    if program.components().count() > 1 && program.is_relative() {
        std::path::absolute(program).unwrap_or_else(|_| program.to_path_buf())
    } else {
        program.to_path_buf()
    }
}

fn tensors_digest(tensors: &[DenseTensor]) -> u64 {
    let parts: Vec<u64> = tensors.iter().map(DenseTensor::digest64).collect();
    sha256_u64s(&parts)
}

fn build_case_log(
    config: &HarnessConfig,
    case: &GraphCase,
    stem: &str,
    runtime: &CaseRuntime,
    trail: &CaseTrail,
    failure: Option<&CaseFailure>,
    duration_ms: u128,
) -> StructuredCaseLog {
    let (outcome, reason_code) = match failure {
        None => ("pass", "parity_ok"),
        Some(failure) => ("fail", failure.reason_code()),
    };
    let replay_command = format!(
        "cargo run -p gp-conformance --bin run_case -- --case {stem} --format-version {}",
        config.format_version
    );

    let stages: Vec<Value> = runtime
        .ledger()
        .entries()
        .iter()
        .map(|entry| {
            json!({
                "stage": entry.stage.label(),
                "ok": entry.outcome == StageOutcome::Ok,
                "duration_ms": u64::try_from(entry.duration_ms).unwrap_or(u64::MAX),
                "summary": entry.summary,
            })
        })
        .collect();
    let mut extra_fields = BTreeMap::from([
        ("stages".to_string(), Value::Array(stages)),
        (
            "checks".to_string(),
            serde_json::to_value(&trail.checks).unwrap_or(Value::Null),
        ),
        (
            "exit_code".to_string(),
            json!(if failure.is_none() { 0 } else { 1 }),
        ),
    ]);
    if let Some(failure) = failure {
        extra_fields.insert(
            "failure".to_string(),
            serde_json::to_value(failure).unwrap_or(Value::Null),
        );
    }
    if let Some(specialized) = trail.specialized {
        extra_fields.insert("specialized".to_string(), Value::Bool(specialized));
    }
    if let Some(conversion) = trail.conversion.as_ref() {
        extra_fields.insert(
            "conversion".to_string(),
            json!({
                "exit_code": conversion.exit_code,
                "duration_ms": u64::try_from(conversion.duration_ms).unwrap_or(u64::MAX),
                "stdout_tail": conversion.stdout_tail,
                "stderr_tail": conversion.stderr_tail,
                "diagnostic": conversion.diagnostic,
            }),
        );
    }

    StructuredCaseLog::new(
        SUITE_ID,
        stem,
        config.eval_mode,
        case.path,
        case.backend,
        trail.artifact_refs.clone(),
        replay_command,
        outcome,
        reason_code,
    )
    .with_inputs(case.seed, trail.format_version, trail.input_digest)
    .with_output_digest(trail.output_digest)
    .with_duration_ms(duration_ms)
    .with_extra_fields(extra_fields)
}

/// Converter timeout from its textual form. `0` disables the timeout.
pub fn parse_timeout_millis(raw: &str) -> Result<Option<u64>, String> {
    let millis: u64 = raw
        .trim()
        .parse()
        .map_err(|error| format!("is not a millisecond count: {error}"))?;
    Ok((millis > 0).then_some(millis))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gp_core::InputSpec;
    use gp_graph::{GraphDef, GraphError, GraphSession, ValueId};

    use super::{
        Backend, CandidateRunner, CaseFailure, ExportPath, GraphCase, HarnessConfig, PolicySet,
        Verdict, parse_flag, parse_timeout_millis, run_case, summarize_passes,
    };

    struct Doubler;

    impl GraphDef for Doubler {
        fn forward(
            &self,
            session: &mut GraphSession,
            inputs: &[ValueId],
        ) -> Result<Vec<ValueId>, GraphError> {
            Ok(vec![session.mul_scalar(inputs[0], 2.0)?])
        }
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let vars = BTreeMap::from([
            ("GP_CONVERTER", "/opt/pnnx/bin/pnnx"),
            ("GP_FORMAT_VERSION", "11"),
            ("GP_CONVERTER_TIMEOUT_MS", "2500"),
            ("GP_KEEP_ARTIFACTS", "yes"),
            ("GP_MODULE_RUNNER", "/usr/local/bin/run-module"),
        ]);
        let config = HarnessConfig::default_paths()
            .with_env_overrides(|key| vars.get(key).map(|value| (*value).to_string()))
            .expect("valid overrides");
        assert_eq!(config.format_version, 11);
        assert_eq!(config.converter_timeout_millis, Some(2500));
        assert!(config.keep_artifacts);
        assert_eq!(
            config.runner,
            CandidateRunner::Module {
                program: "/usr/local/bin/run-module".into()
            }
        );

        let err = HarnessConfig::default_paths()
            .with_env_overrides(|key| (key == "GP_FORMAT_VERSION").then(|| "new".to_string()))
            .expect_err("non-numeric version");
        assert!(err.contains("GP_FORMAT_VERSION"));

        let zero = HarnessConfig::default_paths()
            .with_env_overrides(|key| (key == "GP_CONVERTER_TIMEOUT_MS").then(|| "0".to_string()))
            .expect("zero disables timeout");
        assert_eq!(zero.converter_timeout_millis, None);
    }

    #[test]
    fn timeout_parsing_treats_zero_as_disabled() {
        assert_eq!(parse_timeout_millis("0"), Ok(None));
        assert_eq!(parse_timeout_millis(" 250 "), Ok(Some(250)));
        let err = parse_timeout_millis("-5").expect_err("negative count");
        assert!(err.starts_with("is not a millisecond count"), "{err}");
        assert!(parse_timeout_millis("soon").is_err());
    }

    #[test]
    fn defaults_block_without_timeout() {
        let config = HarnessConfig::default();
        assert_eq!(config.converter_timeout_millis, None);
        assert_eq!(config.runner, CandidateRunner::Interpreter);
        assert!(!config.keep_artifacts);
    }

    #[test]
    fn missing_converter_fails_the_case() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = HarnessConfig::default_paths()
            .with_work_root(root.path())
            .with_converter("/nonexistent/graph-parity-converter");
        let case = GraphCase::new(
            "Doubler",
            Box::new(Doubler),
            vec![InputSpec::uniform01(vec![4])],
            ExportPath::Trace,
            Backend::Pnnx,
            PolicySet::exact(),
        );
        let report = run_case(&config, &case);
        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.exit_code(), 1);
        assert!(matches!(
            report.failure,
            Some(CaseFailure::ConversionFailure { exit_code: None, .. })
        ));
        assert_eq!(report.forensic_log.reason_code, "conversion_failure");
        assert_eq!(report.forensic_log.outcome, "fail");
        assert!(report.work_dir.is_none());
        // only the work root survives; the case dir was cleaned up
        assert_eq!(std::fs::read_dir(root.path()).expect("list").count(), 0);
    }

    #[test]
    fn invalid_input_spec_is_a_reference_failure() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = HarnessConfig::default_paths().with_work_root(root.path());
        let case = GraphCase::new(
            "zero_dim",
            Box::new(Doubler),
            vec![InputSpec::uniform01(vec![2, 0])],
            ExportPath::Trace,
            Backend::Ncnn,
            PolicySet::exact(),
        );
        let report = run_case(&config, &case);
        assert!(matches!(report.failure, Some(CaseFailure::Reference { .. })));
        assert!(report.conversion.is_none());
    }

    #[test]
    fn helpers_match_expectations() {
        assert_eq!(summarize_passes([true, false, true].into_iter()), (3, 2));
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(Verdict::Fail.exit_code(), 1);
    }
}
