use super::{
    colorize_step, format_size, json_pretty, spin_fail, spin_ok, spinner, CliError,
    EXIT_CANCELLED, EXIT_SUCCESS,
};
use std::path::{Path, PathBuf};
use strata_core::{BuildOutcome, CancelToken, Engine};
use strata_runtime::Backend;

pub fn run(
    engine: &Engine,
    backend: Backend,
    base: &str,
    manifests: &[PathBuf],
    output: Option<&Path>,
    cancel: &CancelToken,
    json: bool,
) -> Result<u8, CliError> {
    let pb = if json {
        None
    } else {
        Some(spinner(&format!(
            "building {base} with {} manifest(s)...",
            manifests.len()
        )))
    };

    let outcome = match engine.build(backend, base, manifests, cancel) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(e.into());
        }
    };

    let report = match outcome {
        BuildOutcome::Completed(report) => report,
        BuildOutcome::Cancelled { completed_steps } => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build cancelled");
            }
            if json {
                let payload = serde_json::json!({
                    "status": "cancelled",
                    "completed_steps": completed_steps,
                });
                println!("{}", json_pretty(&payload)?);
            } else {
                eprintln!("cancelled after {completed_steps} layer(s); finished layers stay cached");
            }
            return Ok(EXIT_CANCELLED);
        }
    };
    if let Some(ref pb) = pb {
        spin_ok(pb, "image built");
    }

    if let Some(path) = output {
        let mut descriptor = report.image.to_json()?;
        descriptor.push('\n');
        std::fs::write(path, descriptor)
            .map_err(|e| CliError::Other(format!("failed to write {}: {e}", path.display())))?;
    }

    if json {
        let payload = serde_json::json!({
            "status": "built",
            "digest": report.image.digest,
            "image": report.image,
            "steps": report.steps,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for step in &report.steps {
            let source = step
                .manifest
                .as_ref()
                .map_or_else(|| format!("base {base}"), |m| m.display().to_string());
            println!(
                "  [{}] {:<8} {}  {:>10}  {source}",
                step.index,
                colorize_step(step.cached),
                step.layer_id.short(),
                format_size(step.size)
            );
        }
        println!(
            "built {} layer(s), {} from cache",
            report.built_steps(),
            report.cached_steps()
        );
        println!("digest: {}", report.image.digest);
    }
    Ok(EXIT_SUCCESS)
}
