//! Path validation against a storage root.
//!
//! Every relative path supplied by a caller goes through [`PathValidator`]
//! before any storage operation touches it.
//!
//! # Security
//!
//! - Paths containing `..` are rejected outright
//! - Characters that are unsafe on common filesystems (`< > : " \ | ? *`) are rejected
//! - For local roots, existing paths are canonicalized (resolving symlinks) and
//!   must stay inside the canonical root
//! - Paths that do not exist yet are authorized through their nearest existing
//!   ancestor, which is canonicalized and checked the same way

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Characters never accepted in a relative path.
pub const FORBIDDEN_PATH_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

/// Reasons a relative path is rejected.
#[derive(Debug, Error)]
pub enum PathError {
    /// The path contains a `..` sequence
    #[error("Path traversal (..) not allowed: {0}")]
    Traversal(String),

    /// The path contains a forbidden character
    #[error("Path contains forbidden character '{character}': {path}")]
    ForbiddenCharacter { path: String, character: char },

    /// The path contains a NUL byte
    #[error("Path contains a null byte")]
    NullByte,

    /// The resolved path lies outside the storage root
    #[error("Path escapes storage root: {0}")]
    EscapesRoot(String),

    /// The storage root itself cannot be resolved
    #[error("Storage root is not accessible: {path}: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The location that bounds every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    /// A directory on the local filesystem
    Local(PathBuf),
    /// A bucket and key prefix in an object store
    Object { bucket: String, prefix: String },
}

impl StorageRoot {
    /// Display form used in log lines
    pub fn display(&self) -> String {
        match self {
            StorageRoot::Local(path) => path.display().to_string(),
            StorageRoot::Object { bucket, prefix } => format!("s3://{}/{}", bucket, prefix),
        }
    }

    /// The local directory, if this is a filesystem root
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            StorageRoot::Local(path) => Some(path),
            StorageRoot::Object { .. } => None,
        }
    }
}

/// Normalize a caller-supplied relative path: strip surrounding slashes and
/// collapse empty segments. The empty string denotes the root.
pub fn normalize_relative(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Validates relative paths against a [`StorageRoot`].
#[derive(Debug, Clone)]
pub struct PathValidator {
    root: StorageRoot,
}

impl PathValidator {
    /// Create a validator bound to `root`
    pub fn new(root: StorageRoot) -> Self {
        Self { root }
    }

    /// The root this validator authorizes against
    pub fn root(&self) -> &StorageRoot {
        &self.root
    }

    /// Validate `path`, returning its normalized relative form.
    ///
    /// The empty path denotes the root itself and is always valid.
    pub fn validate(&self, path: &str) -> Result<String, PathError> {
        check_lexical(path)?;
        let normalized = normalize_relative(path);

        if let StorageRoot::Local(base) = &self.root {
            let base_canonical =
                base.canonicalize()
                    .map_err(|source| PathError::RootUnavailable {
                        path: base.clone(),
                        source,
                    })?;
            authorize_local(&base_canonical, base, &normalized)?;
        }

        Ok(normalized)
    }

    /// Validate `path` and join it onto a local root.
    ///
    /// Returns `None` for object roots, which have no filesystem location.
    pub fn resolve_local(&self, path: &str) -> Result<Option<PathBuf>, PathError> {
        let normalized = self.validate(path)?;
        Ok(self.root.local_path().map(|base| {
            if normalized.is_empty() {
                base.to_path_buf()
            } else {
                base.join(&normalized)
            }
        }))
    }
}

/// Checks that need no filesystem access.
fn check_lexical(path: &str) -> Result<(), PathError> {
    if path.contains("..") {
        return Err(PathError::Traversal(path.to_string()));
    }
    if path.contains('\0') {
        return Err(PathError::NullByte);
    }
    if let Some(character) = path.chars().find(|c| FORBIDDEN_PATH_CHARS.contains(c)) {
        return Err(PathError::ForbiddenCharacter {
            path: path.to_string(),
            character,
        });
    }
    Ok(())
}

/// Authorize `relative` under `base`, walking up to the nearest existing
/// ancestor when the path does not exist yet.
fn authorize_local(base_canonical: &Path, base: &Path, relative: &str) -> Result<(), PathError> {
    if relative.is_empty() {
        return Ok(());
    }

    let full = base.join(relative);
    if full
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(PathError::Traversal(relative.to_string()));
    }

    // symlink_metadata so that dangling links still count as existing entries
    if full.symlink_metadata().is_ok() {
        let canonical = full
            .canonicalize()
            .map_err(|_| PathError::EscapesRoot(relative.to_string()))?;
        if !canonical.starts_with(base_canonical) {
            return Err(PathError::EscapesRoot(relative.to_string()));
        }
        return Ok(());
    }

    let parent = match relative.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    };
    if parent.is_empty() {
        return Ok(());
    }
    authorize_local(base_canonical, base, parent)
}
