//! Filesystem helpers shared by both stage layers.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Map an absolute in-image path (`/usr/local/bin/ord`) onto a layer root.
///
/// Rejects anything that would resolve outside `root`.
pub fn layer_path(root: &Path, image_path: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(image_path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                bail!("image path '{}' escapes the layer root", image_path)
            }
        }
    }
    if out == root {
        bail!("image path '{}' names the layer root itself", image_path);
    }
    Ok(out)
}

/// Copy `src` into the layer at `image_path` with the given mode.
///
/// Parent directories are created with mode 0755. An existing file at the
/// destination is replaced.
pub fn install_file(src: &Path, root: &Path, image_path: &str, mode: u32) -> Result<PathBuf> {
    let dest = layer_path(root, image_path)?;
    if let Some(parent) = dest.parent() {
        create_dirs_with_mode(root, parent, 0o755)?;
    }
    if dest.is_symlink() || dest.exists() {
        fs::remove_file(&dest)
            .with_context(|| format!("Failed to remove existing {}", dest.display()))?;
    }
    fs::copy(src, &dest)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode {:o} on {}", mode, dest.display()))?;
    Ok(dest)
}

fn create_dirs_with_mode(root: &Path, dir: &Path, mode: u32) -> Result<()> {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let mut cursor = root.to_path_buf();
    for part in rel.components() {
        cursor.push(part);
        if cursor.is_dir() {
            continue;
        }
        fs::create_dir(&cursor)
            .with_context(|| format!("Failed to create directory: {}", cursor.display()))?;
        fs::set_permissions(&cursor, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Remove a directory tree if present.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}
