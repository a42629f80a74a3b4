use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use gp_core::{EvalMode, eval_mode_label, sha256_label, sha256_u64};
use gp_export::{Backend, ExportPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CASE_LOG_SCHEMA_VERSION: &str = "gp-case-log/v1";

/// One JSONL forensic record per executed case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u64,
    pub suite_id: String,
    pub case_id: String,
    pub scenario_id: String,
    pub export_path: String,
    pub backend: String,
    pub mode: String,
    pub format_version: u32,
    pub seed: u64,
    pub input_digest: String,
    pub output_digest: String,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub duration_ms: u64,
    pub outcome: String,
    pub reason_code: String,
    #[serde(default)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        case_id: &str,
        mode: EvalMode,
        export_path: ExportPath,
        backend: Backend,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: CASE_LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            case_id: case_id.to_string(),
            scenario_id: scenario_id(suite_id, mode, case_id),
            export_path: export_path.label().to_string(),
            backend: backend.suffix().to_string(),
            mode: eval_mode_label(mode).to_string(),
            format_version: 0,
            seed: 0,
            input_digest: sha256_label(0),
            output_digest: sha256_label(0),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            duration_ms: 0,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_inputs(mut self, seed: u64, format_version: u32, input_digest: u64) -> Self {
        self.seed = seed;
        self.format_version = format_version;
        self.input_digest = sha256_label(input_digest);
        self
    }

    #[must_use]
    pub fn with_output_digest(mut self, output_digest: u64) -> Self {
        self.output_digest = sha256_label(output_digest);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u128) -> Self {
        self.duration_ms = u64::try_from(duration_ms).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }
}

pub fn scenario_id(suite: &str, mode: EvalMode, case_name: &str) -> String {
    format!(
        "{suite}/{}:{}",
        eval_mode_label(mode),
        canonical_case_name(case_name)
    )
}

/// Lowercased name with every character outside `[a-z0-9_-]` replaced by `_`.
/// Doubles as the artifact stem.
pub fn canonical_case_name(case_name: &str) -> String {
    let mut out = String::with_capacity(case_name.len());
    for ch in case_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}

fn env_fingerprint() -> String {
    let raw = format!(
        "{}|{}|{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    );
    sha256_label(sha256_u64(raw.as_bytes()))
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
