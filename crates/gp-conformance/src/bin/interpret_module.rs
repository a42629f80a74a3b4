#![forbid(unsafe_code)]

//! Reference module runner: `interpret_module <module-path>` reads
//! `{"inputs":[...]}` on stdin and prints `{"outputs":[...]}` as its last
//! stdout line.

use std::io::Read;
use std::path::PathBuf;

use gp_conformance::{ModuleRunnerRequest, ModuleRunnerResponse, load_converted_graph};
use gp_graph::execute;

fn main() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let module_path = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| "usage: interpret_module <module-path>".to_string())?;
    if let Some(extra) = args.next() {
        return Err(format!("unexpected arg '{extra}'"));
    }

    let mut body = String::new();
    std::io::stdin()
        .read_to_string(&mut body)
        .map_err(|error| format!("failed reading stdin: {error}"))?;
    let request: ModuleRunnerRequest = serde_json::from_str(&body)
        .map_err(|error| format!("invalid runner request: {error}"))?;

    let graph = load_converted_graph(&module_path)?;
    let outputs = execute(&graph, &request.inputs).map_err(|error| error.to_string())?;
    println!(
        "{}",
        serde_json::to_string(&ModuleRunnerResponse { outputs })
            .map_err(|error| format!("failed to serialize outputs: {error}"))?
    );
    Ok(())
}
