#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use gp_conformance::cases::case_by_name;
use gp_conformance::{
    Backend, CandidateRunner, CaseFailure, ExportPath, GraphCase, HarnessConfig, PolicySet,
    Verdict, run_case,
};
use gp_core::{GenerationRule, InputSpec};
use gp_graph::{GraphDef, GraphError, GraphSession, ValueId};
use gp_runtime::StageKind;

// Writing an executable while another thread forks can make exec fail with
// ETXTBSY, so every test in this file runs under one lock.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

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

/// Input is constant 0.5, so the expected output is `[1.0, 1.0]`.
fn constant_doubler_case() -> GraphCase {
    GraphCase::new(
        "constant_doubler",
        Box::new(Doubler),
        vec![InputSpec::uniform01(vec![2]).with_rule(GenerationRule::Constant { value: 0.5 })],
        ExportPath::Trace,
        Backend::Pnnx,
        PolicySet::exact(),
    )
}

fn runner_config(root: &Path, script: PathBuf) -> HarnessConfig {
    HarnessConfig::default_paths()
        .with_converter(env!("CARGO_BIN_EXE_passthrough_converter"))
        .with_work_root(root.join("work"))
        .with_runner(CandidateRunner::Module { program: script })
}

#[test]
fn converter_nonzero_exit_fails_with_its_exit_code() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let converter = write_script(root.path(), "broken.sh", "echo 'unsupported layer' >&2\nexit 3");
    let config = HarnessConfig::default_paths()
        .with_converter(converter)
        .with_work_root(root.path().join("work"));

    let report = run_case(&config, &case_by_name("torch_amin").expect("case"));
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.exit_code(), 1);
    assert!(matches!(
        report.failure,
        Some(CaseFailure::ConversionFailure { exit_code: Some(3), ref reason }) if reason.contains("unsupported layer")
    ));
    let conversion = report.conversion.as_ref().expect("conversion outcome");
    assert_eq!(conversion.stderr_tail, "unsupported layer");
    assert_eq!(report.ledger.failed_stage(), Some(StageKind::Convert));
}

#[test]
fn converter_success_without_module_is_a_conversion_failure() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let converter = write_script(root.path(), "silent.sh", "echo converted\nexit 0");
    let config = HarnessConfig::default_paths()
        .with_converter(converter)
        .with_work_root(root.path().join("work"));

    let report = run_case(&config, &case_by_name("torch_cumprod").expect("case"));
    match report.failure {
        Some(CaseFailure::ConversionFailure { exit_code, ref reason }) => {
            assert_eq!(exit_code, Some(0));
            assert!(reason.contains("torch_cumprod_pnnx.json"), "{reason}");
        }
        ref other => panic!("expected conversion failure, got {other:?}"),
    }
    assert_eq!(
        report.conversion.as_ref().map(|outcome| outcome.stdout_tail.as_str()),
        Some("converted")
    );
}

#[test]
fn converter_is_invoked_with_protocol_arguments_in_work_dir() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let record = root.path().join("invocation.txt");
    let converter = write_script(
        root.path(),
        "record.sh",
        &format!("echo \"$PWD|$1|$2\" > '{}'\nexit 1", record.display()),
    );
    let config = HarnessConfig::default_paths()
        .with_converter(converter)
        .with_work_root(root.path().join("work"));

    let report = run_case(&config, &case_by_name("torch_amin").expect("case"));
    assert_eq!(report.verdict, Verdict::Fail);
    let line = std::fs::read_to_string(&record).expect("recorded invocation");
    let fields: Vec<&str> = line.trim().split('|').collect();
    assert_eq!(fields.len(), 3, "{line}");
    assert!(fields[1].ends_with("torch_amin.trace"));
    assert!(Path::new(fields[1]).starts_with(fields[0]));
    assert_eq!(fields[2], "inputshape=[3,16],[5,9,11],[8,5,9,10]");
}

#[test]
fn converter_timeout_kills_child_and_fails_case() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let converter = write_script(root.path(), "hang.sh", "exec sleep 30");
    let config = HarnessConfig::default_paths()
        .with_converter(converter)
        .with_work_root(root.path().join("work"))
        .with_converter_timeout_millis(Some(200));

    let started = std::time::Instant::now();
    let report = run_case(&config, &case_by_name("torch_amin").expect("case"));
    assert!(started.elapsed().as_secs() < 20);
    assert!(matches!(
        report.failure,
        Some(CaseFailure::ConversionFailure { exit_code: None, ref reason }) if reason.contains("timed out")
    ));
}

#[test]
fn converter_timeout_reaches_children_of_a_wrapper_script() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let converter = write_script(root.path(), "wrapper.sh", "sleep 30\nexit 0");
    let config = HarnessConfig::default_paths()
        .with_converter(converter)
        .with_work_root(root.path().join("work"))
        .with_converter_timeout_millis(Some(200));

    let started = std::time::Instant::now();
    let report = run_case(&config, &case_by_name("torch_amin").expect("case"));
    assert!(started.elapsed().as_secs() < 5, "{:?}", started.elapsed());
    assert!(matches!(
        report.failure,
        Some(CaseFailure::ConversionFailure { exit_code: None, ref reason }) if reason.contains("timed out")
    ));
    assert_eq!(report.ledger.failed_stage(), Some(StageKind::Convert));
}

#[test]
fn cli_zero_timeout_disables_the_deadline() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let converter = write_script(
        root.path(),
        "slow.sh",
        &format!(
            "sleep 0.2\nexec '{}' \"$@\"",
            env!("CARGO_BIN_EXE_passthrough_converter")
        ),
    );
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_run_case"))
        .args(["--case", "torch_amin", "--timeout-ms", "0", "--converter"])
        .arg(&converter)
        .arg("--work-root")
        .arg(root.path().join("work"))
        .env_remove("GP_CONVERTER_TIMEOUT_MS")
        .env_remove("GP_MODULE_RUNNER")
        .output()
        .expect("run_case runs");
    let summary: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("summary json");
    assert_eq!(summary["verdict"], "pass", "{summary}");
    assert_eq!(output.status.code(), Some(0));

    let rejected = std::process::Command::new(env!("CARGO_BIN_EXE_run_case"))
        .args(["--case", "torch_amin", "--timeout-ms", "soon"])
        .output()
        .expect("run_case runs");
    assert!(!rejected.status.success());
    assert!(String::from_utf8_lossy(&rejected.stderr).contains("--timeout-ms 'soon'"));
}

#[test]
fn runner_output_arity_mismatch_is_structural() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let runner = write_script(
        root.path(),
        "empty.sh",
        "cat > /dev/null\necho '{\"outputs\":[]}'",
    );
    let report = run_case(&runner_config(root.path(), runner), &constant_doubler_case());
    assert!(matches!(
        report.failure,
        Some(CaseFailure::StructuralMismatch { ref reason }) if reason.contains("arity")
    ));
    assert_eq!(report.ledger.failed_stage(), Some(StageKind::Compare));
    assert_eq!(report.forensic_log.reason_code, "structural_mismatch");
}

#[test]
fn runner_output_shape_mismatch_is_structural() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let runner = write_script(
        root.path(),
        "reshape.sh",
        "cat > /dev/null\necho '{\"outputs\":[{\"shape\":[1,2],\"dtype\":\"f32\",\"data\":[1.0,1.0]}]}'",
    );
    let report = run_case(&runner_config(root.path(), runner), &constant_doubler_case());
    assert!(matches!(
        report.failure,
        Some(CaseFailure::StructuralMismatch { ref reason }) if reason.contains("shape")
    ));
}

#[test]
fn runner_value_drift_is_a_numerical_mismatch() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let exact = write_script(
        root.path(),
        "exact.sh",
        "cat > /dev/null\necho '{\"outputs\":[{\"shape\":[2],\"dtype\":\"f32\",\"data\":[1.0,1.0]}]}'",
    );
    let report = run_case(&runner_config(root.path(), exact), &constant_doubler_case());
    assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.failure);

    let drifted = write_script(
        root.path(),
        "drift.sh",
        "cat > /dev/null\necho 'warming up'\necho '{\"outputs\":[{\"shape\":[2],\"dtype\":\"f32\",\"data\":[1.0,1.5]}]}'",
    );
    let report = run_case(&runner_config(root.path(), drifted), &constant_doubler_case());
    assert_eq!(
        report.failure,
        Some(CaseFailure::NumericalMismatch { outputs: vec![0] })
    );
    assert_eq!(report.checks.len(), 1);
    assert_eq!(report.checks[0].mismatch_count, 1);
    assert_eq!(report.checks[0].first_mismatch, Some(1));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn runner_garbage_output_is_structural() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let runner = write_script(root.path(), "garbage.sh", "cat > /dev/null\necho 'not json'");
    let report = run_case(&runner_config(root.path(), runner), &constant_doubler_case());
    assert!(matches!(
        report.failure,
        Some(CaseFailure::StructuralMismatch { ref reason }) if reason.contains("not json")
    ));
    assert_eq!(report.ledger.failed_stage(), Some(StageKind::Candidate));
}

#[test]
fn runner_crash_is_a_conversion_failure() {
    let _guard = serial();
    let root = tempfile::tempdir().expect("tempdir");
    let runner = write_script(root.path(), "crash.sh", "cat > /dev/null\necho 'segfault' >&2\nexit 139");
    let report = run_case(&runner_config(root.path(), runner), &constant_doubler_case());
    assert!(matches!(
        report.failure,
        Some(CaseFailure::ConversionFailure { exit_code: Some(139), .. })
    ));
}
