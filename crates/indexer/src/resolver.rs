use crate::Result;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Where a possibly-symlinked path actually points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The path is a symlink; holds its target resolved against the link's directory
    Real(PathBuf),
    /// The path exists and is not a symlink; holds the original path
    NotASymlink(PathBuf),
    Missing,
}

impl Resolved {
    /// Location to watch and read, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Real(path) | Self::NotASymlink(path) => Some(path),
            Self::Missing => None,
        }
    }
}

/// Follows one level of symlink indirection.
///
/// `ENOENT` maps to [`Resolved::Missing`], `EINVAL` (not a link) to
/// [`Resolved::NotASymlink`]; every other failure is returned as an error.
pub async fn resolve(path: &Path) -> Result<Resolved> {
    match tokio::fs::read_link(path).await {
        Ok(target) => {
            let base = path.parent().unwrap_or_else(|| Path::new(""));
            Ok(Resolved::Real(normalize_lexically(&base.join(target))))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Resolved::Missing),
        Err(err) if err.kind() == ErrorKind::InvalidInput => {
            Ok(Resolved::NotASymlink(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Removes `.` and folds `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
