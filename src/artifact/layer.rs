//! Layer archives: deterministic `tar.zst` packing, extraction and listing.
//!
//! Packed layers are reproducible: entries are sorted by relative path and
//! carry mtime 0 and uid/gid 0, so the same tree always yields the same bytes.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// One path in a layer, relative to its root and without a leading `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
}

/// Pack `src_dir` into a deterministic `tar.zst` at `out_path`.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = TarBuilder::new(encoder);

    for (rel, p) in sorted_entries(src_dir)? {
        let md = fs::symlink_metadata(&p)?;
        let mode = md.permissions().mode() & 0o7777;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode);

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Unpack a `.tar` or `.tar.zst` archive into `dest`.
///
/// The compression is detected from the zstd frame magic, not the extension.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let reader = open_archive(archive)?;
    let mut archive_reader = tar::Archive::new(reader);
    archive_reader.set_preserve_permissions(true);
    archive_reader.set_unpack_xattrs(false);
    archive_reader
        .unpack(dest)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    Ok(())
}

/// List the entries of a `.tar` or `.tar.zst` archive, sorted by path.
pub fn list_archive(archive: &Path) -> Result<Vec<LayerEntry>> {
    let reader = open_archive(archive)?;
    let mut archive_reader = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive_reader
        .entries()
        .with_context(|| format!("Failed to read {}", archive.display()))?
    {
        let entry = entry?;
        let header = entry.header();
        let path = normalize_entry_path(&entry.path()?);
        if path.is_empty() {
            continue;
        }
        let kind = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
            tar::EntryType::Directory => EntryKind::Dir,
            tar::EntryType::Symlink => EntryKind::Symlink,
            _ => EntryKind::Other,
        };
        out.push(LayerEntry {
            path,
            kind,
            mode: header.mode().unwrap_or(0),
            size: header.size().unwrap_or(0),
        });
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn open_archive(archive: &Path) -> Result<Box<dyn Read>> {
    let mut f =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut magic = [0u8; 4];
    let n = f.read(&mut magic)?;
    drop(f);

    let f = BufReader::new(File::open(archive)?);
    if n == 4 && magic == ZSTD_MAGIC {
        Ok(Box::new(zstd::stream::Decoder::new(f)?))
    } else {
        Ok(Box::new(f))
    }
}

fn sorted_entries(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for ent in WalkDir::new(root).follow_links(false) {
        let ent = ent.with_context(|| format!("Failed to walk {}", root.display()))?;
        if ent.path() == root {
            continue;
        }
        let rel = ent
            .path()
            .strip_prefix(root)
            .unwrap_or(ent.path())
            .to_string_lossy()
            .replace('\\', "/");
        entries.push((rel, ent.path().to_path_buf()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

fn normalize_entry_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    raw.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("usr/local/bin")).unwrap();
        fs::write(root.join("usr/local/bin/ord"), b"binary").unwrap();
        fs::set_permissions(
            root.join("usr/local/bin/ord"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("usr/bin", root.join("bin")).unwrap();
    }

    #[test]
    fn packing_is_reproducible() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        sample_tree(&tree);

        let a = tmp.path().join("a.tar.zst");
        let b = tmp.path().join("b.tar.zst");
        create_tar_zst(&tree, &a).unwrap();
        create_tar_zst(&tree, &b).unwrap();

        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn walk_errors_are_not_swallowed() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("layer.tar.zst");

        let err = create_tar_zst(&tmp.path().join("missing"), &out).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to walk"));
    }

    #[test]
    fn listing_is_sorted_and_typed() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        sample_tree(&tree);
        let archive = tmp.path().join("layer.tar.zst");
        create_tar_zst(&tree, &archive).unwrap();

        let from_archive = list_archive(&archive).unwrap();
        let paths: Vec<_> = from_archive.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["bin", "usr", "usr/local", "usr/local/bin", "usr/local/bin/ord"]
        );
        assert_eq!(from_archive[0].kind, EntryKind::Symlink);

        let ord = from_archive
            .iter()
            .find(|e| e.path == "usr/local/bin/ord")
            .unwrap();
        assert_eq!(ord.kind, EntryKind::File);
        assert_eq!(ord.mode & 0o777, 0o755);
        assert_eq!(ord.size, 6);
    }

    #[test]
    fn unpacks_plain_tar_and_zstd() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        sample_tree(&tree);

        let zst = tmp.path().join("layer.tar.zst");
        create_tar_zst(&tree, &zst).unwrap();

        let plain = tmp.path().join("layer.tar");
        {
            let mut builder = TarBuilder::new(File::create(&plain).unwrap());
            builder.follow_symlinks(false);
            builder.append_dir_all(".", &tree).unwrap();
            builder.finish().unwrap();
        }

        for (archive, dest) in [(&zst, "out-zst"), (&plain, "out-tar")] {
            let out = tmp.path().join(dest);
            unpack_archive(archive, &out).unwrap();
            assert_eq!(fs::read(out.join("usr/local/bin/ord")).unwrap(), b"binary");
            assert!(out.join("bin").is_symlink());
        }
    }
}
