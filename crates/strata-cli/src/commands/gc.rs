use super::{format_size, json_pretty, CliError, EXIT_SUCCESS};
use strata_core::{CancelToken, Engine, LockMode, StoreLock};

pub fn run(
    engine: &Engine,
    budget: Option<u64>,
    dry_run: bool,
    cancel: &CancelToken,
    json: bool,
) -> Result<u8, CliError> {
    let lock = StoreLock::acquire(&engine.store_layout().lock_file(), LockMode::Exclusive)?;
    let report = engine.gc(&lock, budget, dry_run, cancel)?;

    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "report": report,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    let verb = if dry_run { "would evict" } else { "evicted" };
    match &report.eviction {
        Some(eviction) => {
            println!(
                "gc: {verb} {} layer(s), {} freed; {} of {} budget in use ({} pinned)",
                eviction.evicted.len(),
                format_size(eviction.freed),
                format_size(eviction.total_after),
                format_size(eviction.budget),
                report.pinned
            );
            if eviction.over_budget {
                println!("gc: still over budget; remaining layers are pinned by images or have children");
            }
        }
        None => println!("gc: no cache budget configured, skipping eviction"),
    }
    let verb = if dry_run { "would remove" } else { "removed" };
    println!(
        "gc: {verb} {} unreferenced archive(s)",
        report.orphaned_objects.len()
    );
    Ok(EXIT_SUCCESS)
}
