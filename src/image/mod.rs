//! Runtime images: packed rootfs blob plus its [`ImageConfig`].
//!
//! The rootfs is stored as a deterministic `tar.zst` under
//! `runtime_image/<tag>`. The config travels in the index entry's metadata,
//! so the blob digest depends on filesystem content alone.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact_store::{ArtifactStore, StoredArtifact, KIND_RUNTIME_IMAGE, META_ARTIFACT_KEY};
use crate::stages::s00_builder::ArtifactRef;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
const CONFIG_META_KEY: &str = "config";

/// Declared process and provenance of a runtime image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub schema: u32,
    pub tag: String,
    /// Default process. Exactly `[install_path]` for images built here.
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub runtime_base: String,
    pub toolchain: String,
    pub features: Vec<String>,
    pub artifact: ArtifactRef,
    pub install_path: String,
    pub trust_provider: String,
    pub trust_packages: Vec<String>,
    pub run_id: String,
}

impl ImageConfig {
    /// Command line a supervisor runs when the image is launched without
    /// arguments.
    pub fn default_process(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .chain(self.cmd.iter())
            .cloned()
            .collect()
    }
}

/// A committed image.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    pub tag: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub config: ImageConfig,
}

/// Pack `rootfs` and publish it under `config.tag`.
///
/// This is the single point where a tag becomes visible; callers invoke it
/// only after every earlier step has succeeded.
pub fn commit_image(
    store: &ArtifactStore,
    rootfs: &Path,
    config: &ImageConfig,
) -> Result<RuntimeImage> {
    let mut meta = BTreeMap::new();
    meta.insert(
        CONFIG_META_KEY.to_string(),
        serde_json::to_value(config).context("serializing image config")?,
    );
    meta.insert(
        META_ARTIFACT_KEY.to_string(),
        serde_json::Value::String(config.artifact.input_key.clone()),
    );
    let sha256 = store
        .commit_layer(KIND_RUNTIME_IMAGE, &config.tag, rootfs, meta)
        .with_context(|| format!("committing image '{}'", config.tag))?;
    let stored = store
        .get(KIND_RUNTIME_IMAGE, &config.tag)?
        .with_context(|| format!("image '{}' missing right after commit", config.tag))?;

    Ok(RuntimeImage {
        tag: config.tag.clone(),
        sha256,
        size_bytes: stored.entry.size_bytes,
        config: config.clone(),
    })
}

/// Resolve a tag, verifying the blob digest.
pub fn load_image(store: &ArtifactStore, tag: &str) -> Result<(StoredArtifact, ImageConfig)> {
    let stored = store
        .get_verified(KIND_RUNTIME_IMAGE, tag)
        .with_context(|| format!("resolving image '{}'", tag))?;
    let raw = stored
        .entry
        .meta
        .get(CONFIG_META_KEY)
        .cloned()
        .with_context(|| format!("image '{}' has no config", tag))?;
    let config: ImageConfig = serde_json::from_value(raw)
        .with_context(|| format!("parsing config of image '{}'", tag))?;
    Ok((stored, config))
}

/// List committed images, newest first.
pub fn list_images(store: &ArtifactStore) -> Result<Vec<(String, String)>> {
    Ok(store
        .list_kind(KIND_RUNTIME_IMAGE)?
        .into_iter()
        .map(|e| (e.key, e.blob_sha256))
        .collect())
}

/// Write `<dest>/rootfs/` and `<dest>/config.json` for an image.
pub fn export_image(store: &ArtifactStore, tag: &str, dest: &Path) -> Result<ImageConfig> {
    let (_, config) = load_image(store, tag)?;
    fs::create_dir_all(dest).with_context(|| format!("creating '{}'", dest.display()))?;
    store
        .extract_layer(KIND_RUNTIME_IMAGE, tag, &dest.join("rootfs"))
        .with_context(|| format!("extracting image '{}'", tag))?;
    let config_path = dest.join("config.json");
    fs::write(
        &config_path,
        serde_json::to_vec_pretty(&config).context("serializing image config")?,
    )
    .with_context(|| format!("writing '{}'", config_path.display()))?;
    Ok(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_config(tag: &str) -> ImageConfig {
        ImageConfig {
            schema: CONFIG_SCHEMA_VERSION,
            tag: tag.to_string(),
            entrypoint: vec!["/usr/local/bin/ord".into()],
            cmd: vec![],
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            runtime_base: "scratch".into(),
            toolchain: "rust:1.76.0".into(),
            features: vec!["rollback".into()],
            artifact: ArtifactRef {
                input_key: "k".repeat(64),
                sha256: "0".repeat(64),
                layer_path: "/usr/src/ord/target/release/ord".into(),
            },
            install_path: "/usr/local/bin/ord".into(),
            trust_provider: "host-bundle".into(),
            trust_packages: vec![],
            run_id: "run1".into(),
        }
    }

    #[test]
    fn commit_load_export() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(&tmp.path().join("store")).unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("usr/local/bin")).unwrap();
        fs::write(rootfs.join("usr/local/bin/ord"), b"bin").unwrap();

        let image = commit_image(&store, &rootfs, &sample_config("ord:test")).unwrap();
        assert_eq!(image.tag, "ord:test");

        let (_, config) = load_image(&store, "ord:test").unwrap();
        assert_eq!(config.default_process(), vec!["/usr/local/bin/ord".to_string()]);

        let out = tmp.path().join("export");
        export_image(&store, "ord:test", &out).unwrap();
        assert!(out.join("rootfs/usr/local/bin/ord").is_file());
        assert!(out.join("config.json").is_file());

        assert_eq!(
            list_images(&store).unwrap(),
            vec![("ord:test".to_string(), image.sha256)]
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(&tmp.path().join("store")).unwrap();
        assert!(load_image(&store, "ord:none").is_err());
    }
}
