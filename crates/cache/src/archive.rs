//! Archive packaging for remote cache entries
//!
//! Remote entries travel as a single zstd-compressed tar of the captured
//! files, so an upload or download is all-or-nothing: there is no partially
//! transferred entry to misread.

use crate::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

const ZSTD_LEVEL: i32 = 3;

/// Package the listed files (relative to `root`) into an in-memory
/// `tar.zst` archive.
///
/// # Errors
///
/// Returns an error if a listed path is absolute, climbs out of `root`, or
/// cannot be read.
pub fn pack_files(root: &Path, files: &[PathBuf]) -> Result<Vec<u8>> {
    let encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)
        .map_err(|e| Error::io_no_path(e, "zstd encode"))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for rel in files {
        ensure_contained(rel)?;
        let full = root.join(rel);
        if full.is_dir() {
            builder
                .append_dir_all(rel, &full)
                .map_err(|e| Error::io(e, &full, "tar append_dir_all"))?;
        } else {
            builder
                .append_path_with_name(&full, rel)
                .map_err(|e| Error::io(e, &full, "tar append"))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io_no_path(e, "tar finalize"))?;
    encoder
        .finish()
        .map_err(|e| Error::io_no_path(e, "zstd finish"))
}

/// List the file paths contained in an archive without unpacking it.
///
/// # Errors
///
/// Returns an error if the archive is not valid `tar.zst`.
pub fn list(bytes: &[u8]) -> Result<Vec<PathBuf>> {
    let decoder =
        zstd::Decoder::new(bytes).map_err(|e| Error::io_no_path(e, "zstd decode"))?;
    let mut archive = tar::Archive::new(decoder);
    let mut paths = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Error::io_no_path(e, "tar entries"))?
    {
        let entry = entry.map_err(|e| Error::io_no_path(e, "tar entry"))?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::io_no_path(e, "tar entry path"))?;
        paths.push(path.into_owned());
    }
    Ok(paths)
}

/// Unpack an archive into `root`, returning the restored relative paths.
///
/// # Errors
///
/// Returns an error if the archive is invalid, contains a path that would
/// escape `root`, or a file cannot be written.
pub fn unpack_into(root: &Path, bytes: &[u8]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(root).map_err(|e| Error::io(e, root, "create_dir_all"))?;
    let decoder =
        zstd::Decoder::new(bytes).map_err(|e| Error::io_no_path(e, "zstd decode"))?;
    let mut archive = tar::Archive::new(decoder);
    let mut restored = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Error::io_no_path(e, "tar entries"))?
    {
        let mut entry = entry.map_err(|e| Error::io_no_path(e, "tar entry"))?;
        let path = entry
            .path()
            .map_err(|e| Error::io_no_path(e, "tar entry path"))?
            .into_owned();
        ensure_contained(&path)?;

        let unpacked = entry
            .unpack_in(root)
            .map_err(|e| Error::io(e, root.join(&path), "unpack"))?;
        if !unpacked {
            return Err(Error::configuration(format!(
                "archive entry {} would escape the workspace root",
                path.display()
            )));
        }
        if !entry.header().entry_type().is_dir() {
            restored.push(path);
        }
    }
    Ok(restored)
}

/// Reject paths that are absolute or climb out of the workspace root.
///
/// Applied symmetrically: at capture time (put/pack) so no entry is ever
/// stored under an escaping path, and at unpack time for archives from the
/// remote store.
pub(crate) fn ensure_contained(path: &Path) -> Result<()> {
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::RootDir | Component::ParentDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::configuration(format!(
            "path {} would escape the workspace root",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pack_unpack_preserves_contents_and_layout() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("dist/assets")).unwrap();
        fs::write(src.path().join("dist/out.js"), b"bundle").unwrap();
        fs::write(src.path().join("dist/assets/logo.svg"), b"<svg/>").unwrap();
        fs::write(src.path().join("report.txt"), b"ok").unwrap();

        let files = vec![PathBuf::from("dist"), PathBuf::from("report.txt")];
        let bytes = pack_files(src.path(), &files).unwrap();

        let listed = list(&bytes).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&PathBuf::from("dist/out.js")));
        assert!(listed.contains(&PathBuf::from("report.txt")));

        let dst = TempDir::new().unwrap();
        let restored = unpack_into(dst.path(), &bytes).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(fs::read(dst.path().join("dist/out.js")).unwrap(), b"bundle");
        assert_eq!(
            fs::read(dst.path().join("dist/assets/logo.svg")).unwrap(),
            b"<svg/>"
        );
        assert_eq!(fs::read(dst.path().join("report.txt")).unwrap(), b"ok");
    }

    #[test]
    fn test_pack_rejects_absolute_paths() {
        let src = TempDir::new().unwrap();
        let result = pack_files(src.path(), &[PathBuf::from("/etc/passwd")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_pack_rejects_parent_dir_paths() {
        let outer = TempDir::new().unwrap();
        let src = outer.path().join("workspace");
        fs::create_dir_all(&src).unwrap();
        fs::write(outer.path().join("secret.txt"), b"leaked").unwrap();

        // The file is readable via the parent component, but packing it
        // would produce an archive that can never be restored.
        assert!(pack_files(&src, &[PathBuf::from("../secret.txt")]).is_err());
        assert!(pack_files(&src, &[PathBuf::from("a/../../secret.txt")]).is_err());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dst = TempDir::new().unwrap();
        assert!(unpack_into(dst.path(), b"not an archive").is_err());
    }

    #[test]
    fn test_ensure_contained() {
        assert!(ensure_contained(Path::new("dist/out.js")).is_ok());
        assert!(ensure_contained(Path::new("../escape")).is_err());
        assert!(ensure_contained(Path::new("/abs")).is_err());
        assert!(ensure_contained(Path::new("a/../../b")).is_err());
    }
}
