//! Pipeline run bookkeeping under `<store>/runs/<run_id>/`.
//!
//! Each run directory holds the private stage layers while the run is active
//! and a `run-manifest.json` that outlives them. The manifest is rewritten
//! atomically on every state change (`building` -> `success` | `failed`).

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Success,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub image_tag: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    #[serde(default)]
    pub finished_at_utc: Option<String>,
    pub toolchain: String,
    pub runtime_base: String,
    pub features: Vec<String>,
    #[serde(default)]
    pub snapshot_sha256: Option<String>,
    /// Builder input key; equal keys mean the builder saw identical inputs.
    #[serde(default)]
    pub input_key: Option<String>,
    #[serde(default)]
    pub artifact_sha256: Option<String>,
    #[serde(default)]
    pub image_sha256: Option<String>,
    #[serde(default)]
    pub failure_class: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_run_metadata(run_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, metadata)
        .with_context(|| format!("writing run metadata '{}'", path.display()))
}

pub fn read_run_metadata(run_dir: &Path) -> Result<RunMetadata> {
    let path = manifest_path(run_dir);
    let bytes =
        fs::read(&path).with_context(|| format!("reading run metadata '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing run metadata '{}'", path.display()))
}

pub fn load_runs_metadata(runs_root: &Path) -> Result<Vec<RunMetadata>> {
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_root)
        .with_context(|| format!("reading runs directory '{}'", runs_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        if !manifest_path(&run_dir).is_file() {
            continue;
        }
        runs.push(read_run_metadata(&run_dir)?);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run_id(runs_root: &Path) -> Result<Option<String>> {
    let runs = load_runs_metadata(runs_root)?;
    Ok(runs
        .into_iter()
        .find(|run| run.status == RunStatus::Success)
        .map(|run| run.run_id))
}

/// Remove finished runs beyond the newest `keep`. Runs still `building` are
/// never touched: their layers may be in use.
pub fn prune_old_runs(runs_root: &Path, keep: usize) -> Result<usize> {
    let runs = load_runs_metadata(runs_root)?;
    let mut removed = 0;
    for run in runs
        .into_iter()
        .filter(|run| run.status != RunStatus::Building)
        .skip(keep)
    {
        let path = runs_root.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

pub fn allocate_run_dir(runs_root: &Path) -> Result<(String, PathBuf)> {
    for _ in 0..32 {
        let run_id = generate_run_id()?;
        let run_root = runs_root.join(&run_id);
        if run_root.exists() {
            continue;
        }
        fs::create_dir_all(&run_root)
            .with_context(|| format!("creating run directory '{}'", run_root.display()))?;
        return Ok((run_id, run_root));
    }
    bail!(
        "failed allocating unique run directory under '{}'",
        runs_root.display()
    )
}

/// Sortable base62 identifier derived from wall clock, pid and a counter.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let suffix = base62_encode_u128(entropy);
    if suffix.len() > 22 {
        bail!("sortable run id overflow while generating run identifier")
    }
    Ok(suffix)
}

pub fn now_utc() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting current UTC timestamp")
}

fn run_sort_key(run: &RunMetadata) -> String {
    // Run ids are time-ordered; the id breaks ties within one timestamp.
    format!("{}|{}", run.created_at_utc, run.run_id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run metadata")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metadata(run_id: &str, created: &str, status: RunStatus) -> RunMetadata {
        RunMetadata {
            run_id: run_id.to_string(),
            image_tag: "ord:test".into(),
            status,
            created_at_utc: created.to_string(),
            finished_at_utc: None,
            toolchain: "rust:1.76.0".into(),
            runtime_base: "scratch".into(),
            features: vec!["rollback".into()],
            snapshot_sha256: None,
            input_key: None,
            artifact_sha256: None,
            image_sha256: None,
            failure_class: None,
            failure: None,
        }
    }

    #[test]
    fn run_ids_are_unique_and_base62() {
        let a = generate_run_id().unwrap();
        let b = generate_run_id().unwrap();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn latest_successful_skips_failures() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path();
        for (id, created, status) in [
            ("A", "2026-01-01T00:00:00Z", RunStatus::Success),
            ("B", "2026-01-02T00:00:00Z", RunStatus::Success),
            ("C", "2026-01-03T00:00:00Z", RunStatus::Failed),
        ] {
            let dir = runs.join(id);
            fs::create_dir_all(&dir).unwrap();
            write_run_metadata(&dir, &metadata(id, created, status)).unwrap();
        }

        assert_eq!(latest_successful_run_id(runs).unwrap().as_deref(), Some("B"));
        let listed: Vec<_> = load_runs_metadata(runs)
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(listed, vec!["C", "B", "A"]);
    }

    #[test]
    fn prune_keeps_newest() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path();
        for (id, created) in [("A", "2026-01-01T00:00:00Z"), ("B", "2026-01-02T00:00:00Z")] {
            let dir = runs.join(id);
            fs::create_dir_all(&dir).unwrap();
            write_run_metadata(&dir, &metadata(id, created, RunStatus::Success)).unwrap();
        }

        assert_eq!(prune_old_runs(runs, 1).unwrap(), 1);
        assert!(runs.join("B").is_dir());
        assert!(!runs.join("A").exists());
    }

    #[test]
    fn prune_leaves_active_runs_alone() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path();
        for (id, created, status) in [
            ("A", "2026-01-01T00:00:00Z", RunStatus::Building),
            ("B", "2026-01-02T00:00:00Z", RunStatus::Failed),
            ("C", "2026-01-03T00:00:00Z", RunStatus::Building),
        ] {
            let dir = runs.join(id);
            fs::create_dir_all(dir.join("builder")).unwrap();
            write_run_metadata(&dir, &metadata(id, created, status)).unwrap();
        }

        assert_eq!(prune_old_runs(runs, 0).unwrap(), 1);
        assert!(runs.join("A/builder").is_dir());
        assert!(!runs.join("B").exists());
        assert!(runs.join("C/builder").is_dir());
    }

    #[test]
    fn missing_runs_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_runs_metadata(&tmp.path().join("nope"))
            .unwrap()
            .is_empty());
    }
}
