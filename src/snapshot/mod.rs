//! Source tree snapshots for the builder stage.
//!
//! The snapshot is a verbatim copy of the project source into the builder
//! layer at the recipe's mount point. Ignore patterns work like a
//! `.dockerignore`: a pattern matches a path relative to the source root
//! either exactly or as a directory prefix. A bare name with no `/` also
//! matches that name at any depth.
//!
//! The digest covers relative paths, entry kinds, the executable bit and file
//! contents, in sorted order. It does not depend on where the tree lives or
//! on timestamps.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A committed source snapshot.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    /// Host path of the snapshot inside the builder layer.
    pub root: PathBuf,
    pub sha256: String,
    pub files: u64,
    pub bytes: u64,
}

/// Copy `source` into `dest` (which must not exist yet), skipping `exclude`.
pub fn take_snapshot(source: &Path, dest: &Path, exclude: &[String]) -> Result<SourceSnapshot> {
    if !source.is_dir() {
        bail!("source tree not found: {}", source.display());
    }
    if dest.exists() {
        bail!(
            "snapshot destination already exists: {}",
            dest.display()
        );
    }
    let source = fs::canonicalize(source)
        .with_context(|| format!("resolving source tree '{}'", source.display()))?;
    fs::create_dir_all(dest)
        .with_context(|| format!("creating snapshot root '{}'", dest.display()))?;

    let mut files = 0u64;
    let mut bytes = 0u64;
    let walker = WalkDir::new(&source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|ent| {
            let rel = relative(&source, ent.path());
            rel.is_empty() || !is_excluded(&rel, exclude)
        });

    for ent in walker {
        let ent = ent.with_context(|| format!("walking source tree '{}'", source.display()))?;
        let rel = relative(&source, ent.path());
        if rel.is_empty() {
            continue;
        }
        let target = dest.join(&rel);
        let file_type = ent.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(ent.path())?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("creating symlink '{}'", target.display()))?;
        } else if file_type.is_file() {
            bytes += fs::copy(ent.path(), &target).with_context(|| {
                format!(
                    "copying '{}' into snapshot",
                    ent.path().display()
                )
            })?;
            files += 1;
        }
    }

    let sha256 = tree_digest(dest)?;
    tracing::debug!(
        source = %source.display(),
        snapshot = %dest.display(),
        files,
        bytes,
        sha256 = %sha256,
        "source snapshot taken"
    );

    Ok(SourceSnapshot {
        root: dest.to_path_buf(),
        sha256,
        files,
        bytes,
    })
}

/// Deterministic digest of a directory tree.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for ent in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let ent = ent.with_context(|| format!("walking '{}'", root.display()))?;
        let rel = relative(root, ent.path());
        if rel.is_empty() {
            continue;
        }
        let file_type = ent.file_type();
        if file_type.is_dir() {
            hasher.update(b"D\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let link = fs::read_link(ent.path())?;
            hasher.update(b"L\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(link.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_file() {
            let md = ent.metadata()?;
            let exec = if md.permissions().mode() & 0o111 != 0 {
                b"x"
            } else {
                b"-"
            };
            hasher.update(b"F\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(exec);
            hasher.update(md.len().to_le_bytes());
            let mut reader = BufReader::new(
                File::open(ent.path())
                    .with_context(|| format!("opening '{}'", ent.path().display()))?,
            );
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub(crate) fn is_excluded(rel: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|pattern| {
        let pattern = pattern.trim_matches('/');
        if pattern.is_empty() {
            return false;
        }
        if rel == pattern || rel.starts_with(&format!("{pattern}/")) {
            return true;
        }
        !pattern.contains('/') && rel.split('/').any(|part| part == pattern)
    })
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
