use super::{json_pretty, CliError, EXIT_STORE_ERROR, EXIT_SUCCESS};
use strata_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, CliError> {
    let report = engine.verify_store()?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "objects:  {}/{} passed",
            report.objects_passed, report.objects_checked
        );
        println!(
            "layers:   {}/{} passed",
            report.layers_passed, report.layers_checked
        );
        println!(
            "bindings: {}/{} passed",
            report.bindings_passed, report.bindings_checked
        );
        println!(
            "images:   {}/{} passed",
            report.images_passed, report.images_checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.hash, f.reason);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
