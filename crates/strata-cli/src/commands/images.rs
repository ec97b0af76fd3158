use super::{format_size, json_pretty, CliError, EXIT_SUCCESS};
use strata_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, CliError> {
    let images = engine.images()?;
    if json {
        println!("{}", json_pretty(&images)?);
    } else if images.is_empty() {
        println!("no images recorded");
    } else {
        println!(
            "{:<14} {:<24} {:>6} {:>10}  RECORDED",
            "DIGEST", "BASE", "LAYERS", "SIZE"
        );
        for image in &images {
            let recorded = engine.recorded_at(&image.digest).unwrap_or_default();
            println!(
                "{:<14} {:<24} {:>6} {:>10}  {recorded}",
                image.digest.short(),
                image.base_ref,
                image.layers.len(),
                format_size(image.total_size())
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
