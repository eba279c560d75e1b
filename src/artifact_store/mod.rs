//! Content-addressed artifact store (default `<recipe dir>/.artifacts/`).
//!
//! ```text
//! blobs/sha256/<xx>/<sha>            immutable content
//! index/build_artifact/<key>.json    builder outputs, keyed by builder input key
//! index/runtime_image/<tag>.json     published tags
//! runs/<run_id>/                     run manifests and private stage layers
//! tmp/ locks/
//! ```
//!
//! The store is the only channel between the two stages. A commit moves its
//! blob into place before it writes the index entry, both by rename, so a
//! reader never sees a half-written artifact. Commits hold the store lock
//! shared; `gc` and pruning take it exclusively and never collect a blob whose
//! index entry is still being written.
//!
//! A tag changes only when a later commit of the same tag replaces it.
//! Housekeeping removes build artifacts and blobs, never tags.

use crate::artifact::filesystem::remove_dir_if_exists;
use crate::artifact::layer::{create_tar_zst, unpack_archive};
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Default store directory name next to the recipe.
pub const DEFAULT_STORE_DIR: &str = ".artifacts";

/// Compiled executables committed by the builder stage.
pub const KIND_BUILD_ARTIFACT: &str = "build_artifact";

/// Packed runtime images, keyed by tag.
pub const KIND_RUNTIME_IMAGE: &str = "runtime_image";

/// Index metadata on a runtime image naming the build artifact it carries.
/// Pruning keeps every build artifact a tag points at.
pub const META_ARTIFACT_KEY: &str = "artifact_key";

const KINDS: &[&str] = &[KIND_BUILD_ARTIFACT, KIND_RUNTIME_IMAGE];
const STORE_LOCK: &str = "store.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// A single file, stored as-is.
    File,
    /// A packed layer (`tar.zst`).
    TarZst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub kind: String,
    pub key: String,
    pub blob_sha256: String,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    pub stored_at_unix_ms: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// An index entry together with where its blob lives.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub entry: IndexEntry,
    pub blob_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub images: usize,
    pub build_artifacts: usize,
    pub blobs: usize,
    pub blob_bytes: u64,
    /// Blobs `gc` would remove.
    pub unreferenced_blobs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub blobs: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [
            store.blobs_dir(),
            store.root.join("index"),
            store.tmp_dir(),
            store.locks_dir(),
            store.runs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("preparing artifact store '{}'", dir.display()))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding per-run manifests and private stage layers.
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn index_path(&self, kind: &str, key: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        validate_key(key)?;
        Ok(self.root.join("index").join(kind).join(format!("{key}.json")))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            bail!("invalid sha256: {sha256}");
        }
        Ok(self.blobs_dir().join(&sha256[..2]).join(sha256))
    }

    fn tmp_path(&self, what: &str) -> PathBuf {
        self.tmp_dir().join(tmp_name(what))
    }

    pub fn get(&self, kind: &str, key: &str) -> Result<Option<StoredArtifact>> {
        let index_path = self.index_path(kind, key)?;
        if !index_path.exists() {
            return Ok(None);
        }
        let entry = read_index(&index_path)?;
        let blob_path = self.blob_path(&entry.blob_sha256)?;
        Ok(Some(StoredArtifact { entry, blob_path }))
    }

    /// Resolve an entry and check that its blob still hashes to the recorded digest.
    pub fn get_verified(&self, kind: &str, key: &str) -> Result<StoredArtifact> {
        let stored = self
            .get(kind, key)?
            .with_context(|| format!("no stored artifact for {kind}:{key}"))?;
        if !stored.blob_path.is_file() {
            bail!(
                "blob missing for {kind}:{key} (expected {})",
                stored.blob_path.display()
            );
        }
        let (actual, _) = sha256_file(&stored.blob_path)?;
        if actual != stored.entry.blob_sha256 {
            bail!(
                "blob hash mismatch for {kind}:{key}\n  expected: {}\n  actual:   {}",
                stored.entry.blob_sha256,
                actual
            );
        }
        Ok(stored)
    }

    /// Commit one file (the builder's executable) under `kind/key`.
    pub fn commit_file(
        &self,
        kind: &str,
        key: &str,
        src: &Path,
        meta: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        if !src.is_file() {
            bail!("source file not found: {}", src.display());
        }
        let _store = self.lock_store_shared()?;
        let tmp = self.tmp_path("file");
        if let Err(err) = fs::copy(src, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(err)
                .with_context(|| format!("copying {} into the store", src.display()));
        }
        self.commit_tmp(kind, key, &tmp, ArtifactFormat::File, meta)
    }

    /// Pack `dir` as a deterministic layer and commit it under `kind/key`.
    pub fn commit_layer(
        &self,
        kind: &str,
        key: &str,
        dir: &Path,
        meta: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        if !dir.is_dir() {
            bail!("layer directory not found: {}", dir.display());
        }
        let _store = self.lock_store_shared()?;
        let tmp = self.tmp_path("layer.tar.zst");
        if let Err(err) = create_tar_zst(dir, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("packing layer {}", dir.display()));
        }
        self.commit_tmp(kind, key, &tmp, ArtifactFormat::TarZst, meta)
    }

    /// Move a finished temp file into the blob store, then point the index at it.
    fn commit_tmp(
        &self,
        kind: &str,
        key: &str,
        tmp: &Path,
        format: ArtifactFormat,
        meta: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        let index_path = self.index_path(kind, key)?;
        let _key = self.lock_key(kind, key)?;

        let (sha256, size_bytes) = sha256_file(tmp)?;
        let blob = self.blob_path(&sha256)?;
        if blob.exists() {
            fs::remove_file(tmp).with_context(|| format!("removing {}", tmp.display()))?;
        } else {
            rename_into(tmp, &blob)?;
        }

        let entry = IndexEntry {
            kind: kind.to_string(),
            key: key.to_string(),
            blob_sha256: sha256.clone(),
            format,
            size_bytes,
            stored_at_unix_ms: now_unix_ms(),
            meta,
        };
        let tmp_index = self.tmp_path("index.json");
        fs::write(&tmp_index, serde_json::to_vec_pretty(&entry)?)
            .with_context(|| format!("writing {}", tmp_index.display()))?;
        rename_into(&tmp_index, &index_path)?;
        tracing::debug!(kind, key, sha256 = %sha256, size_bytes, "committed");
        Ok(sha256)
    }

    /// Unpack the layer stored under `kind/key` into `dest`, replacing it.
    pub fn extract_layer(&self, kind: &str, key: &str, dest: &Path) -> Result<()> {
        let stored = self.get_verified(kind, key)?;
        if stored.entry.format != ArtifactFormat::TarZst {
            bail!("{kind}:{key} is a single file, not a layer");
        }
        remove_dir_if_exists(dest)?;
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        let staging = parent.join(tmp_name(".extract"));
        if let Err(err) = unpack_archive(&stored.blob_path, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        fs::rename(&staging, dest).with_context(|| {
            format!("moving {} to {}", staging.display(), dest.display())
        })
    }

    /// Index entries of one kind, newest first.
    pub fn list_kind(&self, kind: &str) -> Result<Vec<IndexEntry>> {
        validate_kind(kind)?;
        let dir = self.root.join("index").join(kind);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for ent in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = ent?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                out.push(read_index(&path)?);
            }
        }
        out.sort_by(|a, b| {
            b.stored_at_unix_ms
                .cmp(&a.stored_at_unix_ms)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(out)
    }

    /// Build-artifact keys some published tag still carries.
    fn published_artifact_keys(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .list_kind(KIND_RUNTIME_IMAGE)?
            .into_iter()
            .filter_map(|image| {
                image
                    .meta
                    .get(META_ARTIFACT_KEY)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .collect())
    }

    /// Drop build-artifact entries beyond the newest `keep`, sparing any that
    /// a published tag carries. Returns the removed keys.
    pub fn prune_build_artifacts(&self, keep: usize) -> Result<Vec<String>> {
        let _store = self.lock_store_exclusive()?;
        let published = self.published_artifact_keys()?;
        let mut removed = Vec::new();
        for entry in self.list_kind(KIND_BUILD_ARTIFACT)?.into_iter().skip(keep) {
            if published.contains(&entry.key) {
                continue;
            }
            let path = self.index_path(KIND_BUILD_ARTIFACT, &entry.key)?;
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            removed.push(entry.key);
        }
        Ok(removed)
    }

    /// Remove blobs no index entry references, and leftover temp files.
    pub fn gc(&self) -> Result<GcReport> {
        let _store = self.lock_store_exclusive()?;
        let referenced = self.referenced_blobs()?;
        let mut report = GcReport::default();
        for (sha, path, len) in self.blob_files()? {
            if referenced.contains(&sha) {
                continue;
            }
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            report.blobs += 1;
            report.bytes += len;
        }
        for ent in fs::read_dir(self.tmp_dir())? {
            let path = ent?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.with_context(|| format!("removing {}", path.display()))?;
        }
        tracing::info!(blobs = report.blobs, bytes = report.bytes, "store gc");
        Ok(report)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let referenced = self.referenced_blobs()?;
        let blobs = self.blob_files()?;
        Ok(StoreStatus {
            root: self.root.clone(),
            images: self.list_kind(KIND_RUNTIME_IMAGE)?.len(),
            build_artifacts: self.list_kind(KIND_BUILD_ARTIFACT)?.len(),
            blobs: blobs.len(),
            blob_bytes: blobs.iter().map(|(_, _, len)| len).sum(),
            unreferenced_blobs: blobs
                .iter()
                .filter(|(sha, _, _)| !referenced.contains(sha))
                .count(),
        })
    }

    fn referenced_blobs(&self) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for kind in KINDS {
            out.extend(self.list_kind(kind)?.into_iter().map(|e| e.blob_sha256));
        }
        Ok(out)
    }

    /// `(sha, path, size)` of every blob on disk.
    fn blob_files(&self) -> Result<Vec<(String, PathBuf, u64)>> {
        let mut out = Vec::new();
        for ent in WalkDir::new(self.blobs_dir()) {
            let ent = ent.context("walking blob directory")?;
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().into_owned();
            if !is_hex_64(&name) {
                continue;
            }
            let len = ent.metadata().context("reading blob metadata")?.len();
            out.push((name, ent.into_path(), len));
        }
        Ok(out)
    }

    /// Held by every commit. Blocks only while `gc` or pruning runs.
    fn lock_store_shared(&self) -> Result<LockGuard> {
        let file = open_lock_file(&self.locks_dir().join(STORE_LOCK))?;
        file.lock_shared().context("waiting for the store lock")?;
        Ok(LockGuard { _file: file })
    }

    /// Fails instead of waiting: a build in progress should not be stalled
    /// behind housekeeping, nor housekeeping behind a long build.
    fn lock_store_exclusive(&self) -> Result<LockGuard> {
        let path = self.locks_dir().join(STORE_LOCK);
        let file = open_lock_file(&path)?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "artifact store is in use by a running build: {}",
                path.display()
            );
        }
        Ok(LockGuard { _file: file })
    }

    /// Serializes commits of the same key; two builds publishing one tag land
    /// one after the other.
    fn lock_key(&self, kind: &str, key: &str) -> Result<LockGuard> {
        let path = self.locks_dir().join(kind).join(format!("{key}.lock"));
        let file = open_lock_file(&path)?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(LockGuard { _file: file })
    }
}

/// The advisory lock is released when the handle drops.
#[derive(Debug)]
struct LockGuard {
    _file: File,
}

/// Lock files are never unlinked: another process may hold the inode.
fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("opening lock file {}", path.display()))
}

/// Stream a file through sha256. Returns `(hex digest, size)`.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn read_index(path: &Path) -> Result<IndexEntry> {
    let bytes = fs::read(path).with_context(|| format!("reading index {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing index {}", path.display()))
}

/// Temp files live inside the store, so this is always a same-filesystem rename.
fn rename_into(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(src, dst)
        .with_context(|| format!("moving {} to {}", src.display(), dst.display()))
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn validate_kind(kind: &str) -> Result<()> {
    if !KINDS.contains(&kind) {
        bail!("unknown artifact kind '{kind}'");
    }
    Ok(())
}

/// Keys become file names: builder input keys are hex, tags are `name:version`.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
        bail!("artifact key '{key}' is not a safe file name");
    }
    Ok(())
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
