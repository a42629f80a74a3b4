#![forbid(unsafe_code)]

//! Self-test converter speaking the `<artifact> inputshape=<shapes>` protocol.
//! Writes `<stem>_<backend>.json` and `<stem>_<backend>.params.json` for every
//! backend into the current directory.

use std::fs;
use std::path::PathBuf;

use gp_export::{
    Backend, convert_artifact, decode_artifact, encode_module, encode_param_table,
    module_file_name, param_table_file_name, parse_shape_list,
};
use serde_json::json;

fn main() -> Result<(), String> {
    let mut artifact_path: Option<PathBuf> = None;
    let mut input_shapes: Option<Vec<Vec<usize>>> = None;

    for arg in std::env::args().skip(1) {
        if let Some(raw) = arg.strip_prefix("inputshape=") {
            input_shapes = Some(parse_shape_list(raw)?);
        } else if artifact_path.is_none() {
            artifact_path = Some(PathBuf::from(arg));
        } else {
            return Err(format!(
                "unexpected arg '{arg}'. usage: passthrough_converter <artifact> inputshape=[d0,d1],[d0]"
            ));
        }
    }

    let artifact_path =
        artifact_path.ok_or_else(|| "missing artifact path argument".to_string())?;
    let input_shapes = input_shapes.ok_or_else(|| "missing inputshape= argument".to_string())?;
    let stem = artifact_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| format!("artifact path {} has no stem", artifact_path.display()))?;

    let raw = fs::read_to_string(&artifact_path)
        .map_err(|error| format!("failed reading {}: {error}", artifact_path.display()))?;
    let artifact = decode_artifact(&raw).map_err(|error| error.to_string())?;

    let mut written = Vec::new();
    for backend in Backend::ALL {
        let (module, params) = convert_artifact(&artifact, backend, &input_shapes)
            .map_err(|error| error.to_string())?;
        let module_name = module_file_name(stem, backend);
        let params_name = param_table_file_name(stem, backend);
        fs::write(
            &module_name,
            encode_module(&module).map_err(|error| error.to_string())?,
        )
        .map_err(|error| format!("failed writing {module_name}: {error}"))?;
        fs::write(
            &params_name,
            encode_param_table(&params).map_err(|error| error.to_string())?,
        )
        .map_err(|error| format!("failed writing {params_name}: {error}"))?;
        written.push(module_name);
        written.push(params_name);
    }

    println!(
        "{}",
        json!({
            "status": "ok",
            "artifact": artifact_path.display().to_string(),
            "kind": artifact.kind.label(),
            "nodes": artifact.graph.nodes.len(),
            "written": written,
        })
    );
    Ok(())
}
