use std::path::Path;

use anyhow::{bail, Result};
use ord_image::image::{export_image, list_images};
use ord_image::stage_runs::{
    latest_successful_run_id, load_runs_metadata, prune_old_runs, RunStatus,
};
use ord_image::verify::{compare_runs, verify_image};
use ord_image::{load_recipe, resolve_recipe_path, ArtifactStore, ImageRecipe};

fn open_for_recipe(recipe: Option<&str>) -> Result<(ImageRecipe, ArtifactStore)> {
    let recipe_path = resolve_recipe_path(recipe)?;
    let recipe = load_recipe(&recipe_path)?;
    let store = ArtifactStore::open(&recipe.store_root())?;
    Ok((recipe, store))
}

pub(crate) fn verify_cmd(tag: &str, recipe: Option<&String>) -> Result<()> {
    let (recipe, store) = open_for_recipe(recipe.map(String::as_str))?;
    let report = verify_image(&store, &recipe, tag)?;
    for check in &report.checks {
        if check.passed() {
            println!("[image:verify] {} ok", check.name);
            continue;
        }
        println!("[image:verify] {} FAILED", check.name);
        for problem in &check.problems {
            println!("    {}", problem);
        }
    }
    if !report.passed() {
        bail!("image '{}' failed verification", tag);
    }
    println!("[image:verify] {} passed all checks", tag);
    Ok(())
}

pub(crate) fn compare_cmd(run_a: &str, run_b: &str, recipe: Option<&String>) -> Result<()> {
    let (_, store) = open_for_recipe(recipe.map(String::as_str))?;
    let comparison = compare_runs(&store.runs_dir(), run_a, run_b)?;
    println!("[image:compare] {} artifact sha256:{}", run_a, comparison.artifact_a);
    println!("[image:compare] {} artifact sha256:{}", run_b, comparison.artifact_b);
    if !comparison.same_inputs {
        println!("[image:compare] inputs differ; digests are not expected to match");
        return Ok(());
    }
    if !comparison.is_deterministic() {
        bail!(
            "runs {} and {} had identical inputs but produced different artifacts",
            run_a,
            run_b
        );
    }
    println!("[image:compare] identical inputs, identical artifact");
    Ok(())
}

pub(crate) fn export_cmd(tag: &str, dir: &str, recipe: Option<&String>) -> Result<()> {
    let (_, store) = open_for_recipe(recipe.map(String::as_str))?;
    let config = export_image(&store, tag, Path::new(dir))?;
    println!(
        "[image:export] {} -> {} (entrypoint {:?})",
        tag, dir, config.entrypoint
    );
    Ok(())
}

pub(crate) fn runs_cmd(recipe: Option<&String>) -> Result<()> {
    let (_, store) = open_for_recipe(recipe.map(String::as_str))?;
    let runs = load_runs_metadata(&store.runs_dir())?;
    if runs.is_empty() {
        println!("[image:runs] no runs under {}", store.runs_dir().display());
        return Ok(());
    }
    for run in runs {
        let status = match run.status {
            RunStatus::Building => "building",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        let detail = match (&run.failure_class, &run.artifact_sha256) {
            (Some(class), _) => format!("class={class}"),
            (None, Some(sha)) => format!("artifact={}", sha.chars().take(12).collect::<String>()),
            (None, None) => String::new(),
        };
        println!(
            "{}  {:<8}  {}  {}  {}",
            run.run_id, status, run.created_at_utc, run.image_tag, detail
        );
    }
    if let Some(latest) = latest_successful_run_id(&store.runs_dir())? {
        println!("[image:runs] latest successful run: {}", latest);
    }
    Ok(())
}

pub(crate) fn store_status(recipe: Option<&String>) -> Result<()> {
    let (_, store) = open_for_recipe(recipe.map(String::as_str))?;
    let status = store.status()?;
    println!("[image:store] root {}", status.root.display());
    println!(
        "[image:store] {} images, {} build artifacts, {} blobs ({} bytes, {} unreferenced)",
        status.images,
        status.build_artifacts,
        status.blobs,
        status.blob_bytes,
        status.unreferenced_blobs
    );
    for (tag, sha) in list_images(&store)? {
        println!("    {}  sha256:{}", tag, sha);
    }
    Ok(())
}

pub(crate) fn store_gc(recipe: Option<&String>) -> Result<()> {
    let (_, store) = open_for_recipe(recipe.map(String::as_str))?;
    let report = store.gc()?;
    println!(
        "[image:store] removed {} unreferenced blobs ({} bytes)",
        report.blobs, report.bytes
    );
    Ok(())
}

pub(crate) fn store_prune(keep: usize, recipe: Option<&String>) -> Result<()> {
    let (_, store) = open_for_recipe(recipe.map(String::as_str))?;
    let runs = prune_old_runs(&store.runs_dir(), keep)?;
    let artifacts = store.prune_build_artifacts(keep)?;
    let report = store.gc()?;
    println!(
        "[image:store] pruned {} runs and {} build artifacts; removed {} blobs; tags untouched",
        runs,
        artifacts.len(),
        report.blobs
    );
    Ok(())
}
