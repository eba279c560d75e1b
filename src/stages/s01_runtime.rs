//! Runtime stage: pinned base rootfs + the one build artifact + trust store.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::artifact::filesystem::install_file;
use crate::artifact::layer::unpack_archive;
use crate::artifact_store::{sha256_file, ArtifactStore, KIND_BUILD_ARTIFACT};
use crate::error::StageFailure;
use crate::image::{commit_image, ImageConfig, RuntimeImage, CONFIG_SCHEMA_VERSION};
use crate::recipe::{BaseImageRef, RuntimeSpec};
use crate::stages::s00_builder::ArtifactRef;
use crate::trust::{provision, TrustProvisioner};

/// Mode of the installed executable.
pub const ARTIFACT_MODE: u32 = 0o755;

/// Provenance the runtime stage records but does not interpret.
#[derive(Debug, Clone)]
pub struct ImageIdentity {
    pub name: String,
    pub tag: String,
    pub toolchain: String,
    pub features: Vec<String>,
    pub run_id: String,
    pub source_date_epoch: String,
}

/// Run the runtime stage inside `layer` (a fresh, private directory) and
/// publish the image under `identity.tag`.
pub fn run_runtime_stage(
    spec: &RuntimeSpec,
    artifact: &ArtifactRef,
    provisioner: &dyn TrustProvisioner,
    store: &ArtifactStore,
    layer: &Path,
    identity: &ImageIdentity,
) -> Result<RuntimeImage> {
    materialize_base(&spec.base, layer)?;
    tracing::info!(base = %spec.base, "runtime base materialized");

    import_artifact(spec, artifact, store, layer)?;
    tracing::info!(
        install_path = %spec.install_path,
        sha256 = %artifact.sha256,
        "build artifact imported"
    );

    let report = provision(provisioner, layer, &spec.trust.packages)?;

    let mut labels = BTreeMap::new();
    labels.insert(
        "org.opencontainers.image.title".to_string(),
        identity.name.clone(),
    );
    labels.insert(
        "org.opencontainers.image.base.name".to_string(),
        spec.base.to_string(),
    );
    labels.insert(
        "source-date-epoch".to_string(),
        identity.source_date_epoch.clone(),
    );

    let config = ImageConfig {
        schema: CONFIG_SCHEMA_VERSION,
        tag: identity.tag.clone(),
        entrypoint: vec![spec.install_path.clone()],
        cmd: Vec::new(),
        env: BTreeMap::new(),
        labels,
        runtime_base: spec.base.to_string(),
        toolchain: identity.toolchain.clone(),
        features: identity.features.clone(),
        artifact: artifact.clone(),
        install_path: spec.install_path.clone(),
        trust_provider: report.provider,
        trust_packages: report.packages,
        run_id: identity.run_id.clone(),
    };

    let image = commit_image(store, layer, &config)?;
    tracing::info!(tag = %image.tag, sha256 = %image.sha256, "runtime image committed");
    Ok(image)
}

/// Extract the pinned base rootfs into `layer`, or create an empty one for
/// `scratch`.
pub fn materialize_base(base: &BaseImageRef, layer: &Path) -> Result<()> {
    if layer.exists() {
        fs::remove_dir_all(layer)
            .with_context(|| format!("clearing runtime layer '{}'", layer.display()))?;
    }
    fs::create_dir_all(layer)
        .with_context(|| format!("creating runtime layer '{}'", layer.display()))?;

    if base.is_scratch() {
        return Ok(());
    }

    let failure = |reason: String| StageFailure::BaseImage {
        reference: base.to_string(),
        reason,
    };

    let archive = base
        .archive
        .as_deref()
        .ok_or_else(|| failure("no rootfs archive configured".into()))?;
    if !archive.is_file() {
        return Err(failure(format!("archive '{}' not found", archive.display())).into());
    }
    let expected = base
        .sha256
        .as_deref()
        .ok_or_else(|| failure("archive digest is not pinned".into()))?;
    let (actual, _) = sha256_file(archive)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(failure(format!(
            "archive digest mismatch\n  expected: {}\n  actual:   {}",
            expected, actual
        ))
        .into());
    }

    unpack_archive(archive, layer)
        .map_err(|err| failure(format!("{err:#}")))?;
    Ok(())
}

/// Copy the single build artifact into the runtime layer.
///
/// `spec.copy_from` must name the exact path the builder stage produced; a
/// mismatch means the two stage definitions disagree and is fatal.
pub fn import_artifact(
    spec: &RuntimeSpec,
    artifact: &ArtifactRef,
    store: &ArtifactStore,
    layer: &Path,
) -> Result<()> {
    if spec.copy_from != artifact.layer_path {
        return Err(StageFailure::MissingArtifact {
            path: spec.copy_from.clone(),
            reason: format!(
                "builder stage produces '{}', runtime stage imports '{}'",
                artifact.layer_path, spec.copy_from
            ),
        }
        .into());
    }

    let Some(_) = store.get(KIND_BUILD_ARTIFACT, &artifact.input_key)? else {
        return Err(StageFailure::MissingArtifact {
            path: spec.copy_from.clone(),
            reason: format!("no committed artifact for key {}", artifact.input_key),
        }
        .into());
    };
    let stored = store
        .get_verified(KIND_BUILD_ARTIFACT, &artifact.input_key)
        .map_err(|err| StageFailure::MissingArtifact {
            path: spec.copy_from.clone(),
            reason: format!("{err:#}"),
        })?;
    if stored.entry.blob_sha256 != artifact.sha256 {
        return Err(StageFailure::MissingArtifact {
            path: spec.copy_from.clone(),
            reason: format!(
                "store holds {} for this key, handoff expected {}",
                stored.entry.blob_sha256, artifact.sha256
            ),
        }
        .into());
    }

    install_file(&stored.blob_path, layer, &spec.install_path, ARTIFACT_MODE)
        .with_context(|| format!("installing artifact at '{}'", spec.install_path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::layer::create_tar_zst;
    use crate::artifact_store::KIND_RUNTIME_IMAGE;
    use crate::recipe::{TrustProviderKind, TrustSpec};
    use crate::trust::HostBundle;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    struct Fixture {
        tmp: TempDir,
        store: ArtifactStore,
        artifact: ArtifactRef,
        bundle: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(&tmp.path().join("store")).unwrap();
        let bin = tmp.path().join("ord");
        fs::write(&bin, b"#!/bin/sh\n").unwrap();
        let sha256 = store
            .commit_file(KIND_BUILD_ARTIFACT, "key1", &bin, BTreeMap::new())
            .unwrap();
        let bundle = tmp.path().join("bundle.pem");
        fs::write(&bundle, PEM).unwrap();
        Fixture {
            tmp,
            store,
            artifact: ArtifactRef {
                input_key: "key1".into(),
                sha256,
                layer_path: "/usr/src/ord/target/release/ord".into(),
            },
            bundle,
        }
    }

    fn spec(base: BaseImageRef, bundle: &Path) -> RuntimeSpec {
        RuntimeSpec {
            base,
            copy_from: "/usr/src/ord/target/release/ord".into(),
            install_path: "/usr/local/bin/ord".into(),
            trust: TrustSpec {
                provider: TrustProviderKind::HostBundle,
                packages: vec![],
                host_bundle: bundle.to_path_buf(),
            },
        }
    }

    fn identity() -> ImageIdentity {
        ImageIdentity {
            name: "ord".into(),
            tag: "ord:test".into(),
            toolchain: "rust:1.76.0".into(),
            features: vec!["rollback".into()],
            run_id: "run1".into(),
            source_date_epoch: "0".into(),
        }
    }

    fn base_archive(dir: &Path) -> (PathBuf, String) {
        let rootfs = dir.join("base-rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        fs::write(rootfs.join("etc/os-release"), "ID=debian\n").unwrap();
        let archive = dir.join("debian.tar.zst");
        create_tar_zst(&rootfs, &archive).unwrap();
        let (sha, _) = sha256_file(&archive).unwrap();
        (archive, sha)
    }

    #[test]
    fn builds_image_on_pinned_base() {
        let fx = fixture();
        let (archive, sha) = base_archive(fx.tmp.path());
        let base = BaseImageRef {
            name: "debian".into(),
            version: "12.5".into(),
            archive: Some(archive),
            sha256: Some(sha),
        };
        let layer = fx.tmp.path().join("layer");
        let provider = HostBundle {
            bundle: fx.bundle.clone(),
        };

        let image = run_runtime_stage(
            &spec(base, &fx.bundle),
            &fx.artifact,
            &provider,
            &fx.store,
            &layer,
            &identity(),
        )
        .unwrap();

        assert_eq!(image.config.entrypoint, vec!["/usr/local/bin/ord".to_string()]);
        assert!(image.config.cmd.is_empty());
        assert!(image.config.env.is_empty());
        assert!(layer.join("etc/os-release").is_file());
        let mode = fs::metadata(layer.join("usr/local/bin/ord"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, ARTIFACT_MODE);
        assert!(layer.join("etc/ssl/certs/ca-certificates.crt").is_file());
        assert!(fx.store.get(KIND_RUNTIME_IMAGE, "ord:test").unwrap().is_some());
    }

    #[test]
    fn digest_mismatch_rejects_base() {
        let fx = fixture();
        let (archive, _) = base_archive(fx.tmp.path());
        let base = BaseImageRef {
            name: "debian".into(),
            version: "12.5".into(),
            archive: Some(archive),
            sha256: Some("f".repeat(64)),
        };

        let err = materialize_base(&base, &fx.tmp.path().join("layer")).unwrap_err();
        assert_eq!(
            crate::error::failure_class(&err).unwrap().class(),
            "base_image"
        );
    }

    #[test]
    fn renamed_artifact_path_is_fatal() {
        let fx = fixture();
        let mut spec = spec(BaseImageRef::scratch(), &fx.bundle);
        spec.copy_from = "/usr/src/ord/target/release/ord-renamed".into();
        let layer = fx.tmp.path().join("layer");
        fs::create_dir_all(&layer).unwrap();

        let err = import_artifact(&spec, &fx.artifact, &fx.store, &layer).unwrap_err();
        assert_eq!(
            crate::error::failure_class(&err).unwrap().class(),
            "missing_artifact"
        );
        assert!(!layer.join("usr/local/bin/ord").exists());
    }

    #[test]
    fn unknown_handoff_key_is_fatal() {
        let fx = fixture();
        let spec = spec(BaseImageRef::scratch(), &fx.bundle);
        let mut artifact = fx.artifact.clone();
        artifact.input_key = "never-built".into();
        let layer = fx.tmp.path().join("layer");
        fs::create_dir_all(&layer).unwrap();

        let err = import_artifact(&spec, &artifact, &fx.store, &layer).unwrap_err();
        assert_eq!(
            crate::error::failure_class(&err).unwrap().class(),
            "missing_artifact"
        );
    }

    #[test]
    fn trust_failure_publishes_no_tag() {
        let fx = fixture();
        let layer = fx.tmp.path().join("layer");
        let provider = HostBundle {
            bundle: fx.tmp.path().join("missing.pem"),
        };

        let err = run_runtime_stage(
            &spec(BaseImageRef::scratch(), &fx.bundle),
            &fx.artifact,
            &provider,
            &fx.store,
            &layer,
            &identity(),
        )
        .unwrap_err();

        assert_eq!(
            crate::error::failure_class(&err).unwrap().class(),
            "trust_provisioning"
        );
        assert!(fx.store.get(KIND_RUNTIME_IMAGE, "ord:test").unwrap().is_none());
    }
}
