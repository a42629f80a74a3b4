#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use gp_conformance::cases::{builtin_cases, case_by_name};
use gp_conformance::{
    CandidateRunner, HarnessConfig, emit_case_logs, parse_timeout_millis, run_suite,
};
use serde_json::json;

fn main() -> Result<ExitCode, String> {
    let mut config = HarnessConfig::from_env()?;
    let mut selected: Vec<String> = Vec::new();
    let mut log_path: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case" => {
                selected.push(
                    args.next()
                        .ok_or_else(|| "--case requires a case name".to_string())?,
                );
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
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_suite [--case NAME]... [--format-version N] [--converter PATH] [--runner PATH] [--timeout-ms N] [--work-root DIR] [--keep-artifacts] [--log PATH]"
                ));
            }
        }
    }

    let cases = if selected.is_empty() {
        builtin_cases()
    } else {
        selected
            .iter()
            .map(|name| case_by_name(name))
            .collect::<Result<Vec<_>, _>>()?
    };

    let (report, cases) = run_suite(&config, &cases);
    if let Some(log_path) = log_path.as_deref() {
        emit_case_logs(&cases, log_path)?;
    }

    let failures: Vec<_> = cases
        .iter()
        .filter_map(|case| {
            case.failure.as_ref().map(|failure| {
                json!({
                    "case": case.name,
                    "reason_code": failure.reason_code(),
                    "detail": failure.to_string(),
                })
            })
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "suite": report.suite,
            "format_version": report.format_version,
            "cases_total": report.cases_total,
            "cases_passed": report.cases_passed,
            "verdict": report.verdict().label(),
            "failures": failures,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(ExitCode::from(report.exit_code()))
}
