//! Builder stage: source snapshot -> one compiled executable in the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::artifact::filesystem::layer_path;
use crate::artifact_store::{sha256_file, ArtifactStore, KIND_BUILD_ARTIFACT};
use crate::error::StageFailure;
use crate::recipe::BuilderSpec;
use crate::snapshot::{take_snapshot, SourceSnapshot};
use crate::toolchain::{check_features, CompileRequest, Toolchain};

/// Handoff token from the builder stage to the runtime stage.
///
/// The runtime stage resolves the bytes through the store by `input_key` and
/// checks them against `sha256`; `layer_path` is the builder-layer path the
/// artifact was produced at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub input_key: String,
    pub sha256: String,
    pub layer_path: String,
}

#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub reference: ArtifactRef,
    pub size_bytes: u64,
    pub snapshot: SourceSnapshot,
    /// Host path of the binary inside the (private) builder layer.
    pub host_path: PathBuf,
}

/// Run the builder stage inside `layer` (a fresh, private directory).
///
/// Nothing is committed to the store unless the compiler succeeded and the
/// executable exists at the deterministic output path.
pub fn run_builder_stage(
    spec: &BuilderSpec,
    toolchain: &dyn Toolchain,
    store: &ArtifactStore,
    layer: &Path,
    source_date_epoch: &str,
) -> Result<BuildArtifact> {
    fs::create_dir_all(layer)
        .with_context(|| format!("creating builder layer '{}'", layer.display()))?;

    let snapshot_root = layer_path(layer, &spec.mount)?;
    let exclude = snapshot_excludes(spec, store.root());
    let snapshot = take_snapshot(&spec.source_dir, &snapshot_root, &exclude)
        .with_context(|| format!("staging source '{}'", spec.source_dir.display()))?;
    tracing::info!(
        mount = %spec.mount,
        files = snapshot.files,
        sha256 = %snapshot.sha256,
        "source snapshot staged"
    );

    let manifest = snapshot.root.join("Cargo.toml");
    if !manifest.is_file() {
        return Err(StageFailure::Recipe(format!(
            "source tree '{}' has no Cargo.toml",
            spec.source_dir.display()
        ))
        .into());
    }
    check_features(&manifest, &spec.features)?;

    let request = CompileRequest {
        toolchain: spec.toolchain.clone(),
        workdir: snapshot.root.clone(),
        target_dir: snapshot.root.join("target"),
        bin: spec.bin.clone(),
        features: spec.features.clone(),
        locked: spec.locked,
        source_date_epoch: source_date_epoch.to_string(),
    };
    tracing::info!(
        toolchain = %spec.toolchain,
        compiler = %toolchain.describe(),
        bin = %spec.bin,
        features = %spec.features.to_cli_arg(),
        "compiling"
    );
    toolchain.compile(&request)?;

    let output_layer_path = spec.output_layer_path();
    let host_path = layer_path(layer, &output_layer_path)?;
    debug_assert_eq!(host_path, request.expected_output());
    if !host_path.is_file() {
        return Err(StageFailure::MissingArtifact {
            path: output_layer_path,
            reason: "compiler reported success but produced no executable there".into(),
        }
        .into());
    }

    let input_key = builder_input_key(spec, &snapshot.sha256);
    let mut meta = BTreeMap::new();
    meta.insert("toolchain".into(), serde_json::json!(spec.toolchain.channel()));
    meta.insert(
        "features".into(),
        serde_json::json!(spec.features.iter().collect::<Vec<_>>()),
    );
    meta.insert("snapshot_sha256".into(), serde_json::json!(snapshot.sha256));
    meta.insert("layer_path".into(), serde_json::json!(output_layer_path));

    let sha256 = store
        .commit_file(KIND_BUILD_ARTIFACT, &input_key, &host_path, meta)
        .context("committing build artifact")?;
    let (_, size_bytes) = sha256_file(&host_path)?;
    tracing::info!(sha256 = %sha256, size_bytes, "build artifact committed");

    Ok(BuildArtifact {
        reference: ArtifactRef {
            input_key,
            sha256,
            layer_path: output_layer_path,
        },
        size_bytes,
        snapshot,
        host_path,
    })
}

/// Recipe excludes, plus the store itself when it lives inside the source
/// tree (the default layout for `source = "."`).
fn snapshot_excludes(spec: &BuilderSpec, store_root: &Path) -> Vec<String> {
    let mut exclude = spec.exclude.clone();
    let (Ok(source), Ok(store)) = (
        fs::canonicalize(&spec.source_dir),
        fs::canonicalize(store_root),
    ) else {
        return exclude;
    };
    if let Ok(rel) = store.strip_prefix(&source) {
        let rel = rel.to_string_lossy().into_owned();
        if !rel.is_empty() && !exclude.contains(&rel) {
            exclude.push(rel);
        }
    }
    exclude
}

/// Key identifying one builder evaluation: same inputs, same key.
pub fn builder_input_key(spec: &BuilderSpec, snapshot_sha256: &str) -> String {
    let mut hasher = Sha256::new();
    for (field, value) in [
        ("toolchain", spec.toolchain.channel().to_string()),
        ("snapshot", snapshot_sha256.to_string()),
        ("mount", spec.mount.clone()),
        ("bin", spec.bin.clone()),
        ("features", spec.features.to_cli_arg()),
        ("locked", spec.locked.to_string()),
        ("profile", "release".to_string()),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
