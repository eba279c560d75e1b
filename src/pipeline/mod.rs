//! Two-stage orchestration: builder stage, artifact handoff, runtime stage.
//!
//! A run is `building` from the moment its directory is allocated until the
//! runtime stage commits the image tag, at which point it becomes `success`
//! (the image is ready). Any error before that marks the run `failed` and no
//! tag is written or moved.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::artifact::filesystem::remove_dir_if_exists;
use crate::artifact_store::ArtifactStore;
use crate::error::failure_class;
use crate::image::RuntimeImage;
use crate::recipe::{validate_tag, ImageRecipe};
use crate::stage_runs::{
    allocate_run_dir, now_utc, write_run_metadata, RunMetadata, RunStatus,
};
use crate::stages::s00_builder::{run_builder_stage, ArtifactRef};
use crate::stages::s01_runtime::{run_runtime_stage, ImageIdentity};
use crate::toolchain::{CargoToolchain, Toolchain};
use crate::trust::{provisioner_for, TrustProvisioner};

const BUILDER_LAYER_DIR: &str = "builder";
const RUNTIME_LAYER_DIR: &str = "runtime";

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Publish under this tag instead of the recipe's.
    pub tag: Option<String>,
    /// Exported to the compiler. Falls back to `$SOURCE_DATE_EPOCH`, then `0`.
    pub source_date_epoch: Option<String>,
    /// Leave `builder/` and `runtime/` in the run directory for inspection.
    pub keep_layers: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub artifact: ArtifactRef,
    pub image: RuntimeImage,
}

pub struct Pipeline {
    recipe: ImageRecipe,
    store: ArtifactStore,
    toolchain: Box<dyn Toolchain>,
    provisioner: Box<dyn TrustProvisioner>,
}

impl Pipeline {
    /// Pipeline with the production collaborators and the recipe's store.
    pub fn new(recipe: ImageRecipe) -> Result<Self> {
        let store = ArtifactStore::open(&recipe.store_root())?;
        Ok(Self::with_store(recipe, store))
    }

    pub fn with_store(recipe: ImageRecipe, store: ArtifactStore) -> Self {
        let provisioner = provisioner_for(&recipe.runtime.trust);
        Self {
            recipe,
            store,
            toolchain: Box::new(CargoToolchain::default()),
            provisioner,
        }
    }

    pub fn with_toolchain(mut self, toolchain: Box<dyn Toolchain>) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Box<dyn TrustProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn recipe(&self) -> &ImageRecipe {
        &self.recipe
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run both stages once. Every invocation is a fresh evaluation: new run
    /// directory, new layers, no reuse of earlier outputs.
    pub fn run(&self, options: &BuildOptions) -> Result<PipelineOutcome> {
        let tag = options
            .tag
            .clone()
            .unwrap_or_else(|| self.recipe.tag.clone());
        validate_tag(&tag)?;
        let source_date_epoch = options
            .source_date_epoch
            .clone()
            .or_else(|| std::env::var("SOURCE_DATE_EPOCH").ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0".to_string());

        let runs_root = self.store.runs_dir();
        let (run_id, run_dir) = allocate_run_dir(&runs_root)?;
        let mut metadata = RunMetadata {
            run_id: run_id.clone(),
            image_tag: tag.clone(),
            status: RunStatus::Building,
            created_at_utc: now_utc()?,
            finished_at_utc: None,
            toolchain: self.recipe.builder.toolchain.to_string(),
            runtime_base: self.recipe.runtime.base.to_string(),
            features: self
                .recipe
                .builder
                .features
                .iter()
                .map(str::to_string)
                .collect(),
            snapshot_sha256: None,
            input_key: None,
            artifact_sha256: None,
            image_sha256: None,
            failure_class: None,
            failure: None,
        };
        write_run_metadata(&run_dir, &metadata)?;
        tracing::info!(run_id = %run_id, tag = %tag, "run started");

        let result = self.run_stages(&run_id, &run_dir, &tag, &source_date_epoch, &mut metadata);

        if !options.keep_layers {
            for layer in [BUILDER_LAYER_DIR, RUNTIME_LAYER_DIR] {
                if let Err(err) = remove_dir_if_exists(&run_dir.join(layer)) {
                    tracing::warn!(
                        run_id = %run_id,
                        layer,
                        error = %format!("{err:#}"),
                        "layer cleanup failed"
                    );
                }
            }
        }

        metadata.finished_at_utc = Some(now_utc()?);
        match result {
            Ok((artifact, image)) => {
                metadata.status = RunStatus::Success;
                metadata.image_sha256 = Some(image.sha256.clone());
                write_run_metadata(&run_dir, &metadata)?;
                tracing::info!(run_id = %run_id, tag = %image.tag, "image ready");
                Ok(PipelineOutcome {
                    run_id,
                    run_dir,
                    artifact,
                    image,
                })
            }
            Err(err) => {
                metadata.status = RunStatus::Failed;
                metadata.failure_class = failure_class(&err).map(|f| f.class().to_string());
                metadata.failure = Some(format!("{err:#}"));
                if let Err(write_err) = write_run_metadata(&run_dir, &metadata) {
                    tracing::error!(
                        run_id = %run_id,
                        error = %format!("{write_err:#}"),
                        "could not record failed run"
                    );
                }
                tracing::error!(
                    run_id = %run_id,
                    class = metadata.failure_class.as_deref().unwrap_or("internal"),
                    "run failed"
                );
                Err(err.context(format!("build run {run_id} failed")))
            }
        }
    }

    fn run_stages(
        &self,
        run_id: &str,
        run_dir: &Path,
        tag: &str,
        source_date_epoch: &str,
        metadata: &mut RunMetadata,
    ) -> Result<(ArtifactRef, RuntimeImage)> {
        let built = run_builder_stage(
            &self.recipe.builder,
            self.toolchain.as_ref(),
            &self.store,
            &run_dir.join(BUILDER_LAYER_DIR),
            source_date_epoch,
        )
        .context("builder stage")?;
        metadata.snapshot_sha256 = Some(built.snapshot.sha256.clone());
        metadata.input_key = Some(built.reference.input_key.clone());
        metadata.artifact_sha256 = Some(built.reference.sha256.clone());
        write_run_metadata(run_dir, metadata)?;

        let identity = ImageIdentity {
            name: self.recipe.name.clone(),
            tag: tag.to_string(),
            toolchain: self.recipe.builder.toolchain.to_string(),
            features: metadata.features.clone(),
            run_id: run_id.to_string(),
            source_date_epoch: source_date_epoch.to_string(),
        };
        let image = run_runtime_stage(
            &self.recipe.runtime,
            &built.reference,
            self.provisioner.as_ref(),
            &self.store,
            &run_dir.join(RUNTIME_LAYER_DIR),
            &identity,
        )
        .context("runtime stage")?;

        Ok((built.reference, image))
    }
}
