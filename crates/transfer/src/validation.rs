use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Checks that a relative path stays beneath whatever directory it is
/// joined onto.
///
/// Rejects empty paths, absolute paths, `..` components and Windows
/// prefixes (`C:`, `\\server`).
pub fn validate_relative(rel: &str) -> Result<(), TransferError> {
    if rel.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    for component in Path::new(rel).components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {rel}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {rel}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

/// Local destination of a downloaded remote file:
/// `<savedir>/<uid>/<remote path without its leading slash>`.
pub fn local_target(savedir: &Path, uid: u64, remote_path: &str) -> Result<PathBuf, TransferError> {
    let rel = remote_path.trim_start_matches('/');
    validate_relative(rel)?;
    Ok(savedir.join(uid.to_string()).join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_mirrors_remote_tree_per_account() {
        let target = local_target(Path::new("/save"), 42, "/docs/a.txt").unwrap();
        assert_eq!(target, PathBuf::from("/save/42/docs/a.txt"));
    }

    #[test]
    fn root_and_traversal_are_rejected() {
        assert!(local_target(Path::new("/save"), 1, "/").is_err());
        assert!(local_target(Path::new("/save"), 1, "").is_err());
        assert!(local_target(Path::new("/save"), 1, "/../etc/passwd").is_err());
        assert!(local_target(Path::new("/save"), 1, "/a/../../b").is_err());
    }

    #[test]
    fn relative_paths() {
        assert!(validate_relative("sub/file.bin").is_ok());
        assert!(validate_relative("./file.bin").is_ok());
        assert!(validate_relative("sub/../../escape").is_err());
        assert!(validate_relative("/tmp/x").is_err());
    }

    #[cfg(windows)]
    #[test]
    fn rejects_windows_prefix() {
        assert!(validate_relative("C:\\Windows\\evil").is_err());
    }
}
