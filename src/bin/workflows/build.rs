use anyhow::Result;
use ord_image::pipeline::{BuildOptions, Pipeline};
use ord_image::{load_recipe, preflight, resolve_recipe_path};

use crate::workflows::BuildArgs;

pub(crate) fn run_build(args: BuildArgs) -> Result<()> {
    let recipe_path = resolve_recipe_path(args.recipe.as_deref())?;
    let recipe = load_recipe(&recipe_path)?;
    let tag = args.tag.clone().unwrap_or_else(|| recipe.tag.clone());
    println!("[image:recipe] {} -> {}", recipe_path.display(), tag);

    preflight::check_for_recipe(&recipe)?;

    let builder = &recipe.builder;
    println!(
        "[image:builder] {} compiling '{}' from {} (features: {})",
        builder.toolchain,
        builder.bin,
        builder.source_dir.display(),
        if builder.features.is_empty() {
            "none".to_string()
        } else {
            builder.features.to_cli_arg()
        }
    );
    println!(
        "[image:runtime] base {} with trust provider '{}'",
        recipe.runtime.base,
        recipe.runtime.trust.provider.as_str()
    );

    let pipeline = Pipeline::new(recipe)?;
    let outcome = pipeline.run(&BuildOptions {
        tag: args.tag,
        source_date_epoch: None,
        keep_layers: args.keep_layers,
    })?;

    println!(
        "[image:builder] artifact {} sha256:{}",
        outcome.artifact.layer_path, outcome.artifact.sha256
    );
    println!(
        "[image:runtime] image {} sha256:{} ({} bytes)",
        outcome.image.tag, outcome.image.sha256, outcome.image.size_bytes
    );
    println!(
        "[image:{}] ready; default process {:?}",
        outcome.run_id,
        outcome.image.config.default_process()
    );
    if args.keep_layers {
        println!(
            "[image:{}] layers kept under {}",
            outcome.run_id,
            outcome.run_dir.display()
        );
    }
    Ok(())
}
