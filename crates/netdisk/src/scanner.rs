//! Local file discovery for uploads.
//!
//! Relative paths use `/` as separator on every platform and start with
//! the name of the scanned root, so uploading `photos/` into `/backup`
//! yields `/backup/photos/...`.

use std::path::{Path, PathBuf};

use pcs_transfer::validate_relative;

use crate::error::NetdiskError;

/// A local file and where it lands relative to the upload target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub relative: String,
}

/// Lists `root` itself when it is a file, or every file beneath it.
pub fn scan_local(root: &Path) -> Result<Vec<LocalFile>, NetdiskError> {
    let metadata = std::fs::metadata(root)?;
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| NetdiskError::InvalidArgument(format!("no file name: {}", root.display())))?;

    let mut files = Vec::new();
    if metadata.is_file() {
        files.push(LocalFile {
            path: root.to_path_buf(),
            relative: name,
        });
    } else if metadata.is_dir() {
        walk_dir(root, root, &name, &mut files)?;
        files.sort_by(|a, b| a.relative.cmp(&b.relative));
    }

    for file in &files {
        validate_relative(&file.relative)?;
    }
    Ok(files)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    prefix: &str,
    files: &mut Vec<LocalFile>,
) -> Result<(), NetdiskError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(root, &path, prefix, files)?;
        } else if metadata.is_file() {
            let rel = path.strip_prefix(root).map_err(std::io::Error::other)?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            files.push(LocalFile {
                relative: format!("{prefix}/{rel}"),
                path,
            });
        }
    }
    Ok(())
}
