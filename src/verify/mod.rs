//! Post-build checks on a committed image.
//!
//! Each check returns a [`CheckResult`]; [`verify_image`] runs all of them
//! against a tag and the recipe that produced it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::artifact::layer::{list_archive, EntryKind, LayerEntry};
use crate::artifact_store::ArtifactStore;
use crate::image::{load_image, ImageConfig};
use crate::recipe::{BaseImageRef, ImageRecipe};
use crate::stage_runs::{read_run_metadata, RunStatus};
use crate::trust::{is_trust_store_path, TRUST_STORE_PREFIXES};

/// File names that must never appear in a bin directory of the runtime image.
pub const COMPILER_BINARIES: &[&str] = &[
    "rustc", "cargo", "rustup", "rustdoc", "cc", "c++", "gcc", "g++", "clang", "ld", "as",
];

const SOURCE_MARKERS: &[&str] = &["Cargo.toml", "Cargo.lock"];

const BIN_DIRS: &[&str] = &[
    "bin",
    "sbin",
    "usr/bin",
    "usr/sbin",
    "usr/local/bin",
    "usr/local/sbin",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    /// Offending paths or fields; empty means the check passed.
    pub problems: Vec<String>,
}

impl CheckResult {
    fn new(name: &'static str, problems: Vec<String>) -> Self {
        Self { name, problems }
    }

    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub tag: String,
    pub checks: Vec<CheckResult>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }
}

/// No source tree and no compiler made it into the image.
pub fn check_isolation(entries: &[LayerEntry], mount: &str) -> CheckResult {
    let mount = mount.trim_start_matches('/');
    let mut problems = Vec::new();
    for entry in entries {
        let path = entry.path.as_str();
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");

        if path == mount || path.starts_with(&format!("{mount}/")) {
            problems.push(format!("{path}: builder mount present"));
        } else if entry.kind == EntryKind::File
            && (SOURCE_MARKERS.contains(&file_name) || file_name.ends_with(".rs"))
        {
            problems.push(format!("{path}: source file"));
        } else if BIN_DIRS.contains(&parent) && COMPILER_BINARIES.contains(&file_name) {
            problems.push(format!("{path}: compiler binary"));
        }
    }
    CheckResult::new("isolation", problems)
}

/// Everything the image adds over its base is the artifact, its parent
/// directories, or trust-store content. Base entries outside the trust store
/// must come through with the same kind, size and mode.
pub fn check_single_import(
    image: &[LayerEntry],
    base: &[LayerEntry],
    install_path: &str,
) -> CheckResult {
    let install = install_path.trim_start_matches('/');
    let ancestors: BTreeSet<&str> = install
        .match_indices('/')
        .map(|(idx, _)| &install[..idx])
        .collect();
    let base_by_path: BTreeMap<&str, &LayerEntry> =
        base.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut problems = Vec::new();
    let mut artifact_seen = false;
    for entry in image {
        let path = entry.path.as_str();
        if path == install {
            artifact_seen = true;
            if entry.kind != EntryKind::File {
                problems.push(format!("{path}: artifact is not a regular file"));
            } else if entry.mode & 0o111 == 0 {
                problems.push(format!("{path}: artifact is not executable"));
            }
            continue;
        }
        if is_trust_store_path(path) {
            continue;
        }
        if let Some(original) = base_by_path.get(path) {
            if let Some(change) = base_entry_change(original, entry) {
                problems.push(format!("{path}: base entry modified ({change})"));
            }
            continue;
        }
        if entry.kind == EntryKind::Dir && ancestors.contains(path) {
            continue;
        }
        if entry.kind == EntryKind::Dir && is_trust_store_ancestor(path) {
            continue;
        }
        problems.push(format!("{path}: unexpected addition"));
    }
    if !artifact_seen {
        problems.push(format!("{install}: artifact not installed"));
    }
    CheckResult::new("single-import", problems)
}

fn base_entry_change(base: &LayerEntry, image: &LayerEntry) -> Option<String> {
    if base.kind != image.kind {
        return Some(format!("{:?} -> {:?}", base.kind, image.kind));
    }
    let (base_mode, image_mode) = (base.mode & 0o7777, image.mode & 0o7777);
    if base_mode != image_mode {
        return Some(format!("mode {:o} -> {:o}", base_mode, image_mode));
    }
    if base.kind == EntryKind::File && base.size != image.size {
        return Some(format!("size {} -> {}", base.size, image.size));
    }
    None
}

fn is_trust_store_ancestor(dir: &str) -> bool {
    let prefix = format!("{dir}/");
    TRUST_STORE_PREFIXES.iter().any(|p| p.starts_with(&prefix))
}

/// Launching the image without arguments runs exactly the artifact.
pub fn check_entrypoint(config: &ImageConfig, install_path: &str) -> CheckResult {
    let mut problems = Vec::new();
    if config.entrypoint != [install_path.to_string()] {
        problems.push(format!(
            "entrypoint is {:?}, expected [\"{}\"]",
            config.entrypoint, install_path
        ));
    }
    if !config.cmd.is_empty() {
        problems.push(format!("default arguments present: {:?}", config.cmd));
    }
    if !config.env.is_empty() {
        problems.push(format!(
            "environment present: {:?}",
            config.env.keys().collect::<Vec<_>>()
        ));
    }
    if config.install_path != install_path {
        problems.push(format!(
            "config records install path '{}', recipe says '{}'",
            config.install_path, install_path
        ));
    }
    CheckResult::new("entrypoint", problems)
}

/// Entries of the base rootfs; empty for `scratch`.
pub fn base_entries(base: &BaseImageRef) -> Result<Vec<LayerEntry>> {
    if base.is_scratch() {
        return Ok(Vec::new());
    }
    let Some(archive) = base.archive.as_deref() else {
        bail!("base '{}' has no archive to compare against", base);
    };
    list_archive(archive).with_context(|| format!("listing base rootfs '{}'", archive.display()))
}

/// Run every image check for `tag`.
pub fn verify_image(
    store: &ArtifactStore,
    recipe: &ImageRecipe,
    tag: &str,
) -> Result<VerifyReport> {
    let (stored, config) = load_image(store, tag)?;
    let entries = list_archive(&stored.blob_path)
        .with_context(|| format!("listing image '{}'", tag))?;
    let base = base_entries(&recipe.runtime.base)?;
    let install_path = &recipe.runtime.install_path;

    let checks = vec![
        check_isolation(&entries, &recipe.builder.mount),
        check_single_import(&entries, &base, install_path),
        check_entrypoint(&config, install_path),
    ];
    for check in &checks {
        tracing::debug!(
            tag,
            check = check.name,
            problems = check.problems.len(),
            "check finished"
        );
    }
    Ok(VerifyReport {
        tag: tag.to_string(),
        checks,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunComparison {
    /// Both runs recorded the same builder input key.
    pub same_inputs: bool,
    pub artifacts_match: bool,
    pub artifact_a: String,
    pub artifact_b: String,
}

impl RunComparison {
    /// Same inputs must give the same artifact bytes.
    pub fn is_deterministic(&self) -> bool {
        !self.same_inputs || self.artifacts_match
    }
}

/// Compare the build artifacts of two successful runs.
pub fn compare_runs(runs_root: &Path, run_a: &str, run_b: &str) -> Result<RunComparison> {
    let a = read_run_metadata(&runs_root.join(run_a))?;
    let b = read_run_metadata(&runs_root.join(run_b))?;
    for run in [&a, &b] {
        if run.status != RunStatus::Success {
            bail!(
                "run {} is {:?}; only successful runs can be compared",
                run.run_id,
                run.status
            );
        }
    }
    let (Some(artifact_a), Some(artifact_b)) =
        (a.artifact_sha256.clone(), b.artifact_sha256.clone())
    else {
        bail!("run manifests lack artifact digests");
    };

    let same_inputs = a.input_key.is_some() && a.input_key == b.input_key;

    Ok(RunComparison {
        same_inputs,
        artifacts_match: artifact_a == artifact_b,
        artifact_a,
        artifact_b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::sample_config;
    use crate::stage_runs::{write_run_metadata, RunMetadata};
    use std::fs;
    use tempfile::TempDir;

    fn file(path: &str, mode: u32) -> LayerEntry {
        LayerEntry {
            path: path.into(),
            kind: EntryKind::File,
            mode,
            size: 1,
        }
    }

    fn dir(path: &str) -> LayerEntry {
        LayerEntry {
            path: path.into(),
            kind: EntryKind::Dir,
            mode: 0o755,
            size: 0,
        }
    }

    fn runtime_entries() -> Vec<LayerEntry> {
        vec![
            dir("etc"),
            dir("etc/ssl"),
            dir("etc/ssl/certs"),
            file("etc/ssl/certs/ca-certificates.crt", 0o644),
            dir("usr"),
            dir("usr/local"),
            dir("usr/local/bin"),
            file("usr/local/bin/ord", 0o755),
        ]
    }

    #[test]
    fn clean_image_passes() {
        let entries = runtime_entries();
        assert!(check_isolation(&entries, "/usr/src/ord").passed());
        assert!(check_single_import(&entries, &[dir("etc")], "/usr/local/bin/ord").passed());
    }

    #[test]
    fn leaked_build_inputs_are_reported() {
        let mut entries = runtime_entries();
        entries.push(dir("usr/src/ord"));
        entries.push(file("root/main.rs", 0o644));
        entries.push(file("usr/bin/rustc", 0o755));

        let result = check_isolation(&entries, "/usr/src/ord");
        assert_eq!(result.problems.len(), 3);
    }

    #[test]
    fn extra_files_break_single_import() {
        let mut entries = runtime_entries();
        entries.push(file("usr/local/bin/helper", 0o755));

        let result = check_single_import(&entries, &[], "/usr/local/bin/ord");
        assert_eq!(result.problems, vec!["usr/local/bin/helper: unexpected addition"]);
    }

    #[test]
    fn overwritten_base_file_breaks_single_import() {
        let mut base = vec![dir("usr"), dir("usr/bin"), file("usr/bin/ls", 0o755)];
        base[2].size = 100;
        let mut entries = runtime_entries();
        entries.push(dir("usr/bin"));
        let mut ls = file("usr/bin/ls", 0o755);
        ls.size = 999_999;
        entries.push(ls);

        let result = check_single_import(&entries, &base, "/usr/local/bin/ord");
        assert_eq!(
            result.problems,
            vec!["usr/bin/ls: base entry modified (size 100 -> 999999)"]
        );

        entries.last_mut().unwrap().size = 100;
        entries.last_mut().unwrap().mode = 0o4755;
        let result = check_single_import(&entries, &base, "/usr/local/bin/ord");
        assert_eq!(
            result.problems,
            vec!["usr/bin/ls: base entry modified (mode 755 -> 4755)"]
        );
    }

    #[test]
    fn trust_store_may_rewrite_base_entries() {
        let mut bundle = file("etc/ssl/certs/ca-certificates.crt", 0o644);
        bundle.size = 10;
        let base = vec![dir("etc"), dir("etc/ssl"), dir("etc/ssl/certs"), bundle];

        let result = check_single_import(&runtime_entries(), &base, "/usr/local/bin/ord");
        assert!(result.passed(), "{:?}", result.problems);
    }

    #[test]
    fn non_executable_artifact_is_reported() {
        let entries = vec![file("usr/local/bin/ord", 0o644)];
        let result = check_single_import(&entries, &[], "/usr/local/bin/ord");
        assert!(!result.passed());
    }

    #[test]
    fn entrypoint_contract() {
        let config = sample_config("ord:test");
        assert!(check_entrypoint(&config, "/usr/local/bin/ord").passed());

        let mut with_args = config.clone();
        with_args.cmd = vec!["server".into()];
        with_args.env.insert("RUST_LOG".into(), "debug".into());
        assert_eq!(check_entrypoint(&with_args, "/usr/local/bin/ord").problems.len(), 2);
    }

    fn run(id: &str, input_key: &str, artifact: &str) -> RunMetadata {
        RunMetadata {
            run_id: id.into(),
            image_tag: "ord:test".into(),
            status: RunStatus::Success,
            created_at_utc: "2024-01-01T00:00:00Z".into(),
            finished_at_utc: None,
            toolchain: "rust:1.76.0".into(),
            runtime_base: "scratch".into(),
            features: vec!["rollback".into()],
            snapshot_sha256: Some("s1".into()),
            input_key: Some(input_key.into()),
            artifact_sha256: Some(artifact.into()),
            image_sha256: None,
            failure_class: None,
            failure: None,
        }
    }

    fn write(root: &Path, md: &RunMetadata) {
        let dir = root.join(&md.run_id);
        fs::create_dir_all(&dir).unwrap();
        write_run_metadata(&dir, md).unwrap();
    }

    #[test]
    fn compare_flags_nondeterminism() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), &run("a", "k1", "x1"));
        write(tmp.path(), &run("b", "k1", "x1"));
        write(tmp.path(), &run("c", "k1", "x2"));
        write(tmp.path(), &run("d", "k2", "x3"));

        assert!(compare_runs(tmp.path(), "a", "b").unwrap().is_deterministic());
        assert!(!compare_runs(tmp.path(), "a", "c").unwrap().is_deterministic());
        let different = compare_runs(tmp.path(), "a", "d").unwrap();
        assert!(!different.same_inputs);
        assert!(different.is_deterministic());
    }

    #[test]
    fn runtime_base_is_not_a_builder_input() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), &run("a", "k1", "x1"));
        let mut rebased = run("b", "k1", "x2");
        rebased.runtime_base = "debian:12.5@sha256:a3c5e1f0a3c5".into();
        write(tmp.path(), &rebased);

        let comparison = compare_runs(tmp.path(), "a", "b").unwrap();
        assert!(comparison.same_inputs);
        assert!(!comparison.is_deterministic());
    }

    #[test]
    fn runs_without_input_key_are_not_comparable_inputs() {
        let tmp = TempDir::new().unwrap();
        let mut a = run("a", "k1", "x1");
        a.input_key = None;
        let mut b = run("b", "k1", "x2");
        b.input_key = None;
        write(tmp.path(), &a);
        write(tmp.path(), &b);

        assert!(!compare_runs(tmp.path(), "a", "b").unwrap().same_inputs);
    }

    #[test]
    fn failed_runs_are_not_compared() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), &run("a", "k1", "x1"));
        let mut failed = run("b", "k1", "x1");
        failed.status = RunStatus::Failed;
        write(tmp.path(), &failed);

        assert!(compare_runs(tmp.path(), "a", "b").is_err());
    }
}
