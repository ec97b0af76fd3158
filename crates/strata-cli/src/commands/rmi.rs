use super::{json_pretty, CliError, EXIT_SUCCESS};
use strata_core::{Engine, LockMode, StoreLock};

pub fn run(engine: &Engine, digest: &str, json: bool) -> Result<u8, CliError> {
    let lock = StoreLock::acquire(&engine.store_layout().lock_file(), LockMode::Exclusive)?;
    let removed = engine.remove_image(&lock, digest)?;
    if json {
        let payload = serde_json::json!({ "removed": removed });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("removed image {removed}");
    }
    Ok(EXIT_SUCCESS)
}
