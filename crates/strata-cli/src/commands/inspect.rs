use super::{format_size, json_pretty, CliError, EXIT_SUCCESS};
use strata_core::Engine;

pub fn run(engine: &Engine, digest: &str, verify: bool, json: bool) -> Result<u8, CliError> {
    let image = engine.inspect(digest)?;
    if verify {
        engine.verify_image(&image)?;
    }

    if json {
        let payload = serde_json::json!({
            "image": image,
            "recorded_at": engine.recorded_at(&image.digest).ok(),
            "lineage_verified": verify,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("digest:      {}", image.digest);
        println!("base:        {}", image.base_ref);
        println!("size:        {}", format_size(image.total_size()));
        if let Ok(recorded) = engine.recorded_at(&image.digest) {
            println!("recorded_at: {recorded}");
        }
        println!("layers:");
        for (index, layer) in image.layers.iter().enumerate() {
            let manifest = layer
                .manifest_hash
                .as_ref()
                .map_or("(base)", |m| m.short());
            println!(
                "  [{index}] {}  manifest {manifest:<12}  {:>10}",
                layer.layer_id.short(),
                format_size(layer.size)
            );
        }
        if verify {
            println!("lineage:     ok");
        }
    }
    Ok(EXIT_SUCCESS)
}
