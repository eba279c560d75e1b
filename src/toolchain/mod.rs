//! Compiler collaborator for the builder stage.
//!
//! The builder stage only knows the [`Toolchain`] trait: "compile this
//! snapshot, put the binary under this target dir". [`CargoToolchain`] is the
//! production implementation and shells out to `cargo +<channel>`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::error::StageFailure;
use crate::recipe::{FeatureSet, ToolchainRef};

/// Everything one compiler invocation needs.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub toolchain: ToolchainRef,
    /// Snapshot root; the compiler runs with this as working directory.
    pub workdir: PathBuf,
    /// Host path of the `target/` directory inside the builder layer.
    pub target_dir: PathBuf,
    pub bin: String,
    pub features: FeatureSet,
    pub locked: bool,
    pub source_date_epoch: String,
}

impl CompileRequest {
    /// Where a release build leaves the binary.
    pub fn expected_output(&self) -> PathBuf {
        self.target_dir.join("release").join(&self.bin)
    }
}

pub trait Toolchain {
    /// Human-readable identity for logs and run manifests.
    fn describe(&self) -> String;

    /// Compile the request. A non-zero compiler exit must surface as
    /// [`StageFailure::Compile`].
    fn compile(&self, request: &CompileRequest) -> Result<()>;
}

/// `cargo +<channel> build --release` through rustup.
#[derive(Debug, Clone, Default)]
pub struct CargoToolchain {
    /// Cargo executable; `cargo` from `PATH` when unset.
    pub cargo: Option<PathBuf>,
}

impl CargoToolchain {
    /// Argument vector without the program name.
    pub fn build_args(request: &CompileRequest) -> Vec<String> {
        let mut args = vec![
            format!("+{}", request.toolchain.channel()),
            "build".to_string(),
            "--release".to_string(),
            "--bin".to_string(),
            request.bin.clone(),
        ];
        if !request.features.is_empty() {
            args.push("--features".to_string());
            args.push(request.features.to_cli_arg());
        }
        if request.locked {
            args.push("--locked".to_string());
        }
        args
    }
}

impl Toolchain for CargoToolchain {
    fn describe(&self) -> String {
        "cargo".to_string()
    }

    fn compile(&self, request: &CompileRequest) -> Result<()> {
        let program = self
            .cargo
            .clone()
            .unwrap_or_else(|| PathBuf::from("cargo"));
        let args = Self::build_args(request);
        tracing::debug!(
            program = %program.display(),
            args = ?args,
            workdir = %request.workdir.display(),
            "invoking compiler"
        );

        let status = Command::new(&program)
            .args(&args)
            .current_dir(&request.workdir)
            .env("CARGO_TARGET_DIR", &request.target_dir)
            .env("CARGO_INCREMENTAL", "0")
            .env("SOURCE_DATE_EPOCH", &request.source_date_epoch)
            .status()
            .with_context(|| format!("spawning '{}'", program.display()))?;

        if !status.success() {
            return Err(StageFailure::Compile {
                bin: request.bin.clone(),
                status: status.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Features a package manifest accepts: `[features]` keys plus the names of
/// optional dependencies (implicit features).
///
/// Returns `None` for a virtual workspace manifest, where cargo resolves
/// features per member and does the validation itself.
pub fn manifest_features(manifest: &Path) -> Result<Option<BTreeSet<String>>> {
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("reading manifest '{}'", manifest.display()))?;
    let value: toml::Value = toml::from_str(&text)
        .with_context(|| format!("parsing manifest '{}'", manifest.display()))?;

    if value.get("package").is_none() {
        return Ok(None);
    }

    let mut out = BTreeSet::new();
    if let Some(features) = value.get("features").and_then(|f| f.as_table()) {
        out.extend(features.keys().cloned());
    }
    for section in ["dependencies", "build-dependencies"] {
        let Some(deps) = value.get(section).and_then(|d| d.as_table()) else {
            continue;
        };
        for (name, spec) in deps {
            let optional = spec
                .get("optional")
                .and_then(|o| o.as_bool())
                .unwrap_or(false);
            if optional {
                out.insert(name.clone());
            }
        }
    }
    Ok(Some(out))
}

/// Fail with [`StageFailure::Recipe`] when a requested feature is not
/// defined by the manifest.
pub fn check_features(manifest: &Path, features: &FeatureSet) -> Result<()> {
    let Some(known) = manifest_features(manifest)? else {
        tracing::debug!(
            manifest = %manifest.display(),
            "virtual manifest; leaving feature validation to cargo"
        );
        return Ok(());
    };

    let unknown: Vec<&str> = features
        .iter()
        // `dep/feature` and `dep?/feature` name features of dependencies
        .filter(|f| !f.contains('/') && !known.contains(*f))
        .collect();
    if !unknown.is_empty() {
        return Err(StageFailure::Recipe(format!(
            "unknown feature flag(s) {} for '{}'; defined: [{}]",
            unknown.join(", "),
            manifest.display(),
            known.iter().cloned().collect::<Vec<_>>().join(", ")
        ))
        .into());
    }
    Ok(())
}
