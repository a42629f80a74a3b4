#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use gp_conformance::cases::case_by_name;
use gp_conformance::{
    Backend, CandidateRunner, ExportPath, HarnessConfig, emit_case_logs, parse_timeout_millis,
    run_case,
};
use serde_json::json;

const USAGE: &str = "usage: run_case --case NAME [--backend pnnx|ncnn] [--path trace|declarative] [--format-version N] [--converter PATH] [--runner PATH] [--timeout-ms N] [--work-root DIR] [--keep-artifacts] [--log PATH]";

fn main() -> Result<ExitCode, String> {
    let mut config = HarnessConfig::from_env()?;
    let mut case_name: Option<String> = None;
    let mut backend: Option<Backend> = None;
    let mut path: Option<ExportPath> = None;
    let mut log_path: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case" => {
                case_name = Some(
                    args.next()
                        .ok_or_else(|| "--case requires a case name".to_string())?,
                );
            }
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--backend requires one of: pnnx|ncnn".to_string())?;
                backend = Some(Backend::parse(&value)?);
            }
            "--path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--path requires one of: trace|declarative".to_string())?;
                path = Some(parse_export_path(&value)?);
            }
            "--format-version" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--format-version requires an integer".to_string())?;
                config.format_version = value
                    .parse()
                    .map_err(|error| format!("invalid --format-version '{value}': {error}"))?;
            }
            "--converter" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--converter requires a program path".to_string())?;
                config.converter = PathBuf::from(value);
            }
            "--runner" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--runner requires a program path".to_string())?;
                config.runner = CandidateRunner::Module {
                    program: PathBuf::from(value),
                };
            }
            "--timeout-ms" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--timeout-ms requires a millisecond count".to_string())?;
                config.converter_timeout_millis = parse_timeout_millis(&value)
                    .map_err(|reason| format!("--timeout-ms '{value}' {reason}"))?;
            }
            "--work-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--work-root requires a directory".to_string())?;
                config.work_root = PathBuf::from(value);
            }
            "--keep-artifacts" => {
                config.keep_artifacts = true;
            }
            "--log" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log requires a file path".to_string())?;
                log_path = Some(PathBuf::from(value));
            }
            other => return Err(format!("unknown arg '{other}'. {USAGE}")),
        }
    }

    let case_name = case_name.ok_or_else(|| format!("--case is required. {USAGE}"))?;
    let mut case = case_by_name(&case_name)?;
    if let Some(backend) = backend {
        case.backend = backend;
    }
    if let Some(path) = path {
        case.path = path;
    }

    let report = run_case(&config, &case);
    if let Some(log_path) = log_path.as_deref() {
        emit_case_logs(std::slice::from_ref(&report), log_path)?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "case": report.name,
            "scenario_id": report.forensic_log.scenario_id,
            "path": report.path.label(),
            "backend": report.backend.suffix(),
            "format_version": report.forensic_log.format_version,
            "specialized": report.specialized,
            "verdict": report.verdict.label(),
            "reason_code": report.forensic_log.reason_code,
            "failure": report.failure.as_ref().map(ToString::to_string),
            "outputs": report.checks.len(),
            "work_dir": report.work_dir.as_ref().map(|dir| dir.display().to_string()),
            "log_path": log_path.map(|path| path.display().to_string()),
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(ExitCode::from(report.exit_code()))
}

fn parse_export_path(raw: &str) -> Result<ExportPath, String> {
    match raw {
        "trace" => Ok(ExportPath::Trace),
        "declarative" => Ok(ExportPath::Declarative),
        _ => Err(format!(
            "unsupported export path '{raw}'; expected trace|declarative"
        )),
    }
}
